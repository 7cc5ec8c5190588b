//! Heap object kinds (§3). Each variant is a plain Rust struct; the GC
//! marking of references they hold is implemented in `heap::Heap::trace`
//! rather than on the object itself, since tracing needs to push onto
//! the shared grey stack.

use crate::chunk::Chunk;
use crate::handle::Handle;
use crate::table::Table;
use crate::value::Value;

/// An immutable, interned byte string with its cached FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub bytes: Vec<u8>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        // Source is read as bytes (§6); we only ever feed this UTF-8 text
        // derived from the original (valid UTF-8) source, so this holds.
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf8>")
    }
}

/// A compiled function: arity, declared upvalue count, its chunk, and an
/// optional name (absent for the implicit top-level script function).
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<Handle>,
}

impl ObjFunction {
    pub fn new() -> ObjFunction {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

/// Either still pointing at a live operand-stack slot, or closed: owning
/// a Value copied out of that slot once it went out of scope.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

/// A function bundled with the upvalues it closes over. `upvalues.len()`
/// always equals `function.upvalue_count` (§8 invariant).
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    pub methods: Table<Handle>,
}

impl ObjClass {
    pub fn new(name: Handle) -> ObjClass {
        ObjClass {
            name,
            methods: Table::new(),
        }
    }
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: Handle,
    pub fields: Table<Value>,
}

impl ObjInstance {
    pub fn new(class: Handle) -> ObjInstance {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

/// A host-provided native function. Only the calling convention is
/// specified (§4.1/§6); the bodies live in `natives.rs`. Dispatch is by
/// `kind` tag rather than a boxed closure: a closure capturing `&mut
/// Heap` would have to live *inside* the very heap slot it needs to
/// mutate when called, which the borrow checker can't thread through —
/// clox sidesteps this with a free C function pointer and an explicit
/// VM-global struct; tagging and matching in `vm.rs` is the direct Rust
/// equivalent.
#[derive(Debug)]
pub struct ObjNative {
    pub name: Handle,
    pub arity: u8,
    pub kind: NativeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Clock,
    Rand,
    Sqrt,
    Len,
    Print,
    HasProp,
    GetProp,
    SetProp,
    DelProp,
}

/// The discriminated kind of a heap object (§3: "kind tag").
#[derive(Debug)]
pub enum ObjData {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
}

impl ObjData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::String(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound method",
            ObjData::Native(_) => "native function",
        }
    }

    /// Rough size in bytes, used for the GC's allocation heuristic. This
    /// need not be exact — only monotonic with real memory use — since
    /// the threshold is a heuristic, not an accounting requirement.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<ObjData>();
        base + match self {
            ObjData::String(s) => s.bytes.len(),
            ObjData::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            ObjData::Closure(c) => c.upvalues.len() * 8,
            ObjData::Upvalue(_) => 0,
            ObjData::Class(c) => c.methods.len() * 16,
            ObjData::Instance(i) => i.fields.len() * 24,
            ObjData::BoundMethod(_) => 0,
            ObjData::Native(_) => 0,
        }
    }
}
