//! Single-pass Pratt-parsing compiler (§4.2). Grounded on
//! `clox/compiler.c` for the parser/precedence-table shape and
//! scope/local-slot bookkeeping, extended with upvalue resolution,
//! `const`, `switch`, `break`/`continue`, and classes, none of which
//! exist in `original_source/clox` (that copy predates the book's
//! closures/classes chapters) — those parts follow the distilled
//! spec's §4.2/§4.3 prose directly, in the same style as the rest of
//! this module.
//!
//! Global parser/current-compiler state is threaded explicitly through
//! one `Compiler` struct instead of the teacher's file-scope statics
//! (DESIGN.md, "Global parser state... is a local refactor").

use std::collections::HashSet;

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::handle::Handle;
use crate::heap::Heap;
use crate::object::{ObjData, ObjFunction};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        LeftParen | Dot => Precedence::Call,
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        _ => Precedence::None,
    }
}

#[derive(Clone)]
struct LocalVar {
    name: String,
    /// -1 until the initializer has been emitted; blocks self-referential reads.
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct LoopRecord {
    continue_target: usize,
    break_jumps: Vec<usize>,
    scope_depth: i32,
}

/// Per-function compilation state (§4.2 "a nested compiler record per
/// function being compiled"). Held in a `Vec` stack on [`Compiler`]
/// rather than as a linked chain of boxed enclosing pointers, since the
/// stack already gives resolve_upvalue the indexed walk it needs.
struct FunctionState {
    name: Option<String>,
    kind: FunctionKind,
    arity: u8,
    chunk: Chunk,
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopRecord>,
}

impl FunctionState {
    fn new(name: Option<String>, kind: FunctionKind) -> FunctionState {
        // Slot 0 is reserved for the called value itself, or `this` for
        // methods (§4.2 "Local slot 0 of every function").
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionState {
            name,
            kind,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![LocalVar {
                name: slot0_name.to_string(),
                depth: 0,
                is_const: true,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// A deferred check: an assignment to a global that may or may not
/// turn out to be `const` (§4.2/§7: "reassignment to const global,
/// deferred until end-of-compilation for globals", since globals can
/// be declared anywhere, in any order, relative to their uses).
struct DeferredGlobalAssign {
    line: u32,
    name: String,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    stack: Vec<FunctionState>,
    const_globals: HashSet<String>,
    deferred_global_assigns: Vec<DeferredGlobalAssign>,
    /// Upvalue descriptors for the function `end_function` just popped,
    /// staged here so `function()` can emit the CLOSURE operand pairs
    /// after the `FunctionState` itself is gone.
    pending_upvalues: Vec<UpvalueDesc>,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

impl<'src, 'heap> Compiler<'src, 'heap> {
    pub fn compile(source: &'src str, heap: &'heap mut Heap) -> Result<Handle, Vec<CompileError>> {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        let mut compiler = Compiler {
            scanner,
            heap,
            previous: first.clone(),
            current: first,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            stack: vec![FunctionState::new(None, FunctionKind::Script)],
            const_globals: HashSet::new(),
            deferred_global_assigns: Vec::new(),
            pending_upvalues: Vec::new(),
        };
        compiler.advance();

        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
        }
        compiler.consume(TokenKind::Eof, "Expect end of expression.");

        for deferred in &compiler.deferred_global_assigns {
            if compiler.const_globals.contains(&deferred.name) {
                compiler.errors.push(CompileError::new(
                    deferred.line,
                    Some(deferred.name.clone()),
                    format!("Cannot assign to const variable '{}'.", deferred.name),
                ));
                compiler.had_error = true;
            }
        }

        let handle = compiler.end_function();
        if compiler.had_error {
            Err(compiler.errors)
        } else {
            Ok(handle)
        }
    }

    // -- token stream plumbing ------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => Some(String::new()),
            TokenKind::Error => None,
            _ => Some(token.lexeme),
        };
        self.errors.push(CompileError::new(token.line, at, message));
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message);
    }

    /// Statement-boundary recovery (§4.2 "Error handling"): skip tokens
    /// until one that plausibly starts a new statement, clearing panic
    /// mode so later, unrelated errors are still reported.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- emission ---------------------------------------------------------

    fn current_fn(&mut self) -> &mut FunctionState {
        self.stack.last_mut().expect("compiler stack never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    /// Emits `short` with a 1-byte index, or `long` with a little-endian
    /// 3-byte index once the pool exceeds 256 entries (§4.2 "Constants").
    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            let bytes = (index as u32).to_le_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
            self.emit_byte(bytes[2]);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.chunk().add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let handle = self.heap.intern_str(name);
        self.make_constant(Value::Obj(handle))
    }

    /// Returns the jump instruction's operand address, to be patched
    /// later (§4.2 "Jump patching").
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.chunk().code.len();
        let offset = (target - at - 2) as i32;
        let offset = offset as i16;
        let bytes = offset.to_le_bytes();
        self.chunk().code[at] = bytes[0];
        self.chunk().code[at + 1] = bytes[1];
    }

    /// Back-edges are a plain `JUMP` with a negative offset (§4.2's
    /// `while`/`for` lowering names only `JUMP`, not a separate
    /// loop-specific opcode), computed relative to the byte right after
    /// this instruction's own 2-byte operand, same as `emit_jump`/
    /// `patch_jump`'s forward jumps.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Jump);
        let offset = (loop_start as i64 - (self.chunk().code.len() as i64 + 2)) as i32;
        let offset = offset as i16;
        let bytes = offset.to_le_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            // `init` implicitly returns the receiver (slot 0), so a bare
            // `return;` inside a constructor hands back the instance
            // instead of nil.
            self.emit_op(OpCode::IdentLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // -- scopes / locals --------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let fs = self.current_fn();
        fs.scope_depth -= 1;
        let depth = fs.scope_depth;
        while let Some(local) = fs.locals.last() {
            if local.depth <= depth {
                break;
            }
            if fs.locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn().locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str, is_const: bool) {
        let fs = self.current_fn();
        if fs.scope_depth == 0 {
            return;
        }
        let depth = fs.scope_depth;
        for local in fs.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        if fs.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        fs.locals.push(LocalVar {
            name: name.to_string(),
            depth: -1,
            is_const,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let fs = self.current_fn();
        if fs.scope_depth == 0 {
            return;
        }
        let depth = fs.scope_depth;
        fs.locals.last_mut().unwrap().depth = depth;
    }

    /// Resolves `name` to a local slot in function `level`. A local whose
    /// `depth` is still `-1` (its initializer hasn't finished emitting)
    /// is a self-referential read (`var a = a;`) and is a compile error
    /// (§4.2 "blocks self-referential reads"); the slot is still returned
    /// so codegen can proceed without panicking once `had_error` is set.
    fn resolve_local_at(&mut self, level: usize, name: &str) -> Option<(usize, bool)> {
        let found = {
            let fs = &self.stack[level];
            fs.locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name == name)
                .map(|(i, local)| (i, local.is_const, local.depth == -1))
        };
        match found {
            Some((slot, is_const, true)) => {
                self.error("Can't read local variable in its own initializer.");
                Some((slot, is_const))
            }
            Some((slot, is_const, false)) => Some((slot, is_const)),
            None => None,
        }
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some((slot, _)) = self.resolve_local_at(level - 1, name) {
            self.stack[level - 1].locals[slot].is_captured = true;
            return Some(self.add_upvalue(level, slot as u8, true));
        }
        if let Some(index) = self.resolve_upvalue_at(level - 1, name) {
            return Some(self.add_upvalue(level, index, false));
        }
        None
    }

    /// De-duplicates upvalue entries by `(index, is_local)` (§4.2).
    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let fs = &mut self.stack[level];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if fs.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        fs.upvalues.push(UpvalueDesc { index, is_local });
        (fs.upvalues.len() - 1) as u8
    }

    // -- variables ----------------------------------------------------------

    /// Parses a name after `var`/`const`/a parameter, declaring a local
    /// if inside a scope, or returning a global-name constant index
    /// (`None` means "declared as a local, nothing more to do").
    fn parse_variable(&mut self, message: &str, is_const: bool) -> Option<usize> {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.clone();
        if self.current_fn().scope_depth > 0 {
            self.declare_local(&name, is_const);
            None
        } else {
            if is_const {
                self.const_globals.insert(name.clone());
            }
            Some(self.identifier_constant(&name))
        }
    }

    fn define_variable(&mut self, global: Option<usize>) {
        match global {
            None => self.mark_initialized(),
            Some(index) => {
                // VAR_DECL expects [name, value] on the stack (§4.2
                // "emit a constant-load of the name string, then emit a
                // global-load/store opcode").
                self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
                self.emit_op(OpCode::VarDecl);
            }
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let level = self.stack.len() - 1;
        let (load, store, operand): (OpCode, OpCode, Option<u16>);
        let is_const;
        if let Some((slot, c)) = self.resolve_local_at(level, name) {
            load = OpCode::IdentLocal;
            store = OpCode::AssignLocal;
            operand = Some(slot as u16);
            is_const = c;
        } else if let Some(index) = self.resolve_upvalue_at(level, name) {
            load = OpCode::IdentUpvalue;
            store = OpCode::AssignUpvalue;
            operand = Some(index as u16);
            is_const = false;
        } else {
            load = OpCode::IdentGlobal;
            store = OpCode::AssignGlobal;
            operand = None;
            is_const = false;
        }

        let assigning = can_assign && self.match_token(TokenKind::Equal);
        if assigning {
            if is_const {
                self.error("Cannot assign to const variable.");
            }
            if operand.is_none() {
                // global store: push name again so ASSIGN_GLOBAL can pop it.
                let index = self.identifier_constant(name);
                self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
            }
            self.expression();
            if operand.is_none() {
                self.deferred_global_assigns.push(DeferredGlobalAssign {
                    line: self.line(),
                    name: name.to_string(),
                });
            }
            self.emit_op(store);
            if let Some(slot) = operand {
                self.emit_byte(slot as u8);
            }
        } else {
            if operand.is_none() {
                let index = self.identifier_constant(name);
                self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
            }
            self.emit_op(load);
            if let Some(slot) = operand {
                self.emit_byte(slot as u8);
            }
        }
    }

    // -- declarations ---------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(true);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        let global = self.parse_variable("Expect variable name.", is_const);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.clone();
        self.stack.push(FunctionState::new(Some(name), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_fn().arity as usize >= MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_fn().arity += 1;
                let param = self.parse_variable("Expect parameter name.", false);
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let handle = self.end_function();
        let index = self.make_constant(Value::Obj(handle));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, index);
        // `end_function` staged the popped function's upvalue
        // descriptors in `pending_upvalues`; emit the (is_local, index)
        // pair the CLOSURE opcode needs for each one (§4.2 "Constants").
        let upvalues = std::mem::take(&mut self.pending_upvalues);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    /// Finishes compiling the current (innermost) function, wrapping its
    /// chunk into an [`ObjFunction`] allocated on the heap, and pops its
    /// `FunctionState` off the stack.
    fn end_function(&mut self) -> Handle {
        self.emit_return();
        let fs = self.stack.pop().expect("compiler stack never empty");
        let name_handle = fs.name.as_ref().map(|n| self.heap.intern_str(n));
        let upvalue_count = fs.upvalues.len() as u8;
        self.pending_upvalues = fs.upvalues;
        let function = ObjFunction {
            arity: fs.arity,
            upvalue_count,
            chunk: fs.chunk,
            name: name_handle,
        };
        self.heap.alloc(ObjData::Function(function))
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_index = self.identifier_constant(&class_name);
        self.declare_local(&class_name, false);
        let is_global = self.current_fn().scope_depth == 0;

        // For a global, push the name *before* the class value so the
        // two sit in VAR_DECL's expected [name, value] order once we
        // emit OP_CLASS below.
        if is_global {
            self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, name_index);
        }
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_index);

        if is_global {
            self.emit_op(OpCode::VarDecl);
        } else {
            self.mark_initialized();
        }

        let mut has_superclass = false;
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);

            self.begin_scope();
            self.declare_local("super", true);
            self.mark_initialized();

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class value pushed for method binding

        if has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let index = self.identifier_constant(&name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
        self.function(kind);
        self.emit_op(OpCode::Method);
    }

    // -- statements -----------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.current_fn().loops.push(LoopRecord {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: self.current_fn().scope_depth,
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        // Remembers the loop variable's name/slot iff the initializer is a
        // `var` declaration (§4.2 "If the initialiser is a variable
        // declaration..."), so the body can be re-run each iteration
        // against a fresh per-iteration copy (see `loop_var` below).
        let mut loop_var: Option<(String, u8)> = None;
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            let name = self.current.lexeme.clone();
            self.var_declaration(false);
            loop_var = Some((name, (self.current_fn().locals.len() - 1) as u8));
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.current_fn().loops.push(LoopRecord {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: self.current_fn().scope_depth,
        });

        // Per-iteration rebinding (§4.2, §8 "a `for` loop whose body
        // captures the loop variable in a closure must yield, across
        // iterations, closures that each observe a distinct binding").
        // Without this, every iteration's body runs in the *same* scope
        // as the loop variable, so closures captured in different
        // iterations would all share one upvalue over one stack slot.
        // Shadowing the loop variable with a fresh copy, declared in a
        // new scope entered right before the body and exited right
        // after it, gives each iteration's closures their own slot to
        // capture; the copy is written back to the real loop variable
        // before the increment runs, so the loop's own condition/
        // increment see a single, continuously updated counter.
        let inner_slot = loop_var.as_ref().map(|(name, outer_slot)| {
            self.begin_scope();
            self.emit_op(OpCode::IdentLocal);
            self.emit_byte(*outer_slot);
            self.declare_local(name, false);
            self.mark_initialized();
            (self.current_fn().locals.len() - 1) as u8
        });

        self.statement();

        if let (Some((_, outer_slot)), Some(inner_slot)) = (&loop_var, inner_slot) {
            self.emit_op(OpCode::IdentLocal);
            self.emit_byte(inner_slot);
            self.emit_op(OpCode::AssignLocal);
            self.emit_byte(*outer_slot);
            self.emit_op(OpCode::Pop);
            self.end_scope();
        }

        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn end_loop(&mut self) {
        let record = self.current_fn().loops.pop().expect("loop record pushed by caller");
        for jump in record.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut next_case_jump: Option<usize> = None;

        while self.match_token(TokenKind::Case) {
            if let Some(jump) = next_case_jump.take() {
                self.patch_jump(jump);
                self.emit_op(OpCode::Pop);
            }
            self.emit_op(OpCode::Duplicate);
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit_op(OpCode::Eq);
            next_case_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
            self.emit_op(OpCode::Pop); // discard the switch subject copy
            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
            {
                self.declaration();
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
        }

        if let Some(jump) = next_case_jump.take() {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }

        if self.match_token(TokenKind::Default) {
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            self.emit_op(OpCode::Pop); // discard the switch subject
            while !self.check(TokenKind::RightBrace) {
                self.declaration();
            }
        } else {
            self.emit_op(OpCode::Pop);
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
    }

    fn return_statement(&mut self) {
        if self.stack.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn locals_above_loop(&self, loop_depth: i32) -> u8 {
        self.stack
            .last()
            .unwrap()
            .locals
            .iter()
            .filter(|l| l.depth > loop_depth)
            .count() as u8
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(loop_depth) = self.current_fn().loops.last().map(|l| l.scope_depth) else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        let popn = self.locals_above_loop(loop_depth);
        if popn > 0 {
            self.emit_op(OpCode::PopN);
            self.emit_byte(popn);
        }
        let jump = self.emit_jump(OpCode::Jump);
        self.current_fn().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(record_depth_target) = self.current_fn().loops.last().map(|l| (l.scope_depth, l.continue_target))
        else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        let (loop_depth, target) = record_depth_target;
        let popn = self.locals_above_loop(loop_depth);
        if popn > 0 {
            self.emit_op(OpCode::PopN);
            self.emit_byte(popn);
        }
        self.emit_loop(target);
    }

    // -- expressions ------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let can_assign = prec <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while prec <= precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            Nil | True | False => self.literal(kind),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Slash | Star | BangEqual | EqualEqual | Greater | GreaterEqual | Less | LessEqual => {
                self.binary()
            }
            And => self.and(),
            Or => self.or(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op = self.previous.kind;
        let prec = precedence_of(op);
        self.parse_precedence(prec.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => self.emit_op(OpCode::Neq),
            TokenKind::EqualEqual => self.emit_op(OpCode::Eq),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEq),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEq),
            _ => unreachable!(),
        }
    }

    /// `and`: left, `JUMP_IF_FALSE` past right, else `POP` and eval right (§4.2).
    fn and(&mut self) {
        let end = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end);
    }

    /// `or`: left, `JUMP_IF_FALSE` to right, else jump past it (§4.2).
    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc = 0u8;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc as usize == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let index = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, index);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, index);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, index);
        }
    }

    fn this_expr(&mut self) {
        if self.stack.last().unwrap().kind != FunctionKind::Method
            && self.stack.last().unwrap().kind != FunctionKind::Initializer
        {
            self.error("Can't use 'this' outside of a method.");
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let index = self.identifier_constant(&name);

        self.named_variable("this", false);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
        self.named_variable("super", false);
        self.emit_op(OpCode::GetSuper);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = &self.previous.lexeme;
        let inner = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.intern_str(inner);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::object::ObjData;

    /// Returns the compiled top-level chunk's bytecode and constant
    /// count, the only pieces these tests need to inspect.
    fn compile_chunk(source: &str) -> (Vec<u8>, usize) {
        let mut heap = Heap::new(&Config::default());
        let handle = Compiler::compile(source, &mut heap).expect("source must compile");
        match heap.get(handle) {
            ObjData::Function(f) => (f.chunk.code.clone(), f.chunk.constants.len()),
            _ => unreachable!(),
        }
    }

    /// §8 "Constants pool at exactly 256 entries: the 256th must still
    /// use short form; the 257th triggers long form." 257 `print`
    /// statements over distinct numeric literals put one constant per
    /// statement at a known, predictable pool index.
    #[test]
    fn constant_pool_crosses_to_long_form_past_256_entries() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {i};\n"));
        }
        let (code, constants_len) = compile_chunk(&source);
        assert_eq!(constants_len, 257);

        // Walk the bytecode counting CONSTANT/CONSTANT_LONG + PRINT
        // triples, recording which form was used for each of the first
        // two constant-pool indices that straddle the 256-entry boundary.
        let mut forms = Vec::new();
        let mut ip = 0;
        while ip < code.len() {
            let op = OpCode::from_byte(code[ip]);
            match op {
                OpCode::Constant => {
                    forms.push((code[ip + 1] as usize, false));
                    ip += 2;
                }
                OpCode::ConstantLong => {
                    let idx = code[ip + 1] as usize
                        | (code[ip + 2] as usize) << 8
                        | (code[ip + 3] as usize) << 16;
                    forms.push((idx, true));
                    ip += 4;
                }
                OpCode::Print => ip += 1,
                _ => unreachable!("for-loop-free source only emits CONSTANT(_LONG)/PRINT"),
            }
        }
        assert_eq!(forms[255], (255, false), "pool index 255 (256th entry) must still use short form");
        assert_eq!(forms[256], (256, true), "pool index 256 (257th entry) must use long form");
    }

    #[test]
    fn const_global_reassignment_is_deferred_and_reported() {
        let mut heap = Heap::new(&Config::default());
        let errors = Compiler::compile("const x = 1; x = 2;", &mut heap).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("const")));
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let mut heap = Heap::new(&Config::default());
        let errors = Compiler::compile("{ var a = 1; var a = 2; }", &mut heap).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("Already a variable")));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let mut heap = Heap::new(&Config::default());
        let errors = Compiler::compile("break;", &mut heap).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("'break'")));
    }
}
