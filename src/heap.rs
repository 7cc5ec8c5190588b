//! Object memory manager (§4.4, §4.5): allocation, string interning,
//! and the mark-and-sweep tracing collector. Grounded on
//! `clox/memory.c` + `clox/table.c` for the shape of the algorithms,
//! reworked per DESIGN.md's ownership decision: heap objects live in a
//! slotmap (`Vec<Option<HeapSlot>>`) indexed by [`Handle`] rather than
//! behind raw pointers threaded through an intrusive linked list, so
//! there is no unsafe code and no dangling-pointer class of bug.

use crate::config::Config;
use crate::handle::Handle;
use crate::object::ObjData;
use crate::value::Value;

const FNV_PRIME: u32 = 16777619;
const FNV_BASIS: u32 = 2166136261;

/// FNV-1a over raw bytes (§3 "cached 32-bit FNV-1a hash"), grounded on
/// `clox/table.c`'s `stringHash`.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct HeapSlot {
    data: ObjData,
    marked: bool,
}

#[derive(Clone, Copy)]
enum InternSlot {
    Empty,
    Tombstone,
    Occupied(Handle),
}

/// The full heap: every live object, the string-interning table, and
/// GC bookkeeping. One `Heap` per VM (§5: "exactly one VM instance
/// process-wide").
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free_list: Vec<u32>,
    intern: Vec<InternSlot>,
    intern_count: usize,
    intern_used: usize,
    grey_stack: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    growth_factor: usize,
    pub gc_stress: bool,
    /// The `"init"` string is a GC root in its own right (§4.4 step 1)
    /// since the VM looks it up every time it calls a class, not via
    /// any value reachable from the stack.
    pub init_string: Handle,
}

enum Child {
    Value(Value),
    Handle(Handle),
}

impl Heap {
    pub fn new(config: &Config) -> Heap {
        let mut heap = Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            intern: Vec::new(),
            intern_count: 0,
            intern_used: 0,
            grey_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_gc_threshold,
            growth_factor: config.gc_growth_factor,
            gc_stress: config.gc_stress,
            init_string: Handle::from_index(0),
        };
        heap.init_string = heap.intern_str("init");
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.gc_stress || self.bytes_allocated > self.next_gc
    }

    /// Registers a freshly constructed object with the heap, returning
    /// a stable handle to it. Does not itself check the GC threshold —
    /// callers (the VM) decide when to collect per the "allocation
    /// discipline" in §4.4, since only the VM holds the roots a
    /// collection needs to mark.
    pub fn alloc(&mut self, data: ObjData) -> Handle {
        self.bytes_allocated += data.approx_size();
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(HeapSlot { data, marked: false });
            Handle::from_index(index as usize)
        } else {
            self.slots.push(Some(HeapSlot { data, marked: false }));
            Handle::from_index(self.slots.len() - 1)
        }
    }

    pub fn get(&self, handle: Handle) -> &ObjData {
        self.slots[handle.index()]
            .as_ref()
            .map(|s| &s.data)
            .expect("dangling handle: object was swept while still referenced")
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut ObjData {
        self.slots[handle.index()]
            .as_mut()
            .map(|s| &mut s.data)
            .expect("dangling handle: object was swept while still referenced")
    }

    // -- string interning (§4.5) ---------------------------------------

    fn intern_capacity(&self) -> usize {
        self.intern.len()
    }

    /// Finds `bytes` in the intern table, comparing cached hash, then
    /// length, then bytes — only when all three match is the stored
    /// handle the canonical instance (§4.5 "Lookup uses").
    fn find_interned(&self, bytes: &[u8], hash: u32) -> Option<Handle> {
        if self.intern.is_empty() {
            return None;
        }
        let cap = self.intern_capacity();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match self.intern[index] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied(handle) => {
                    if let ObjData::String(s) = self.get(handle) {
                        if s.hash == hash && s.bytes.len() == bytes.len() && s.bytes == bytes {
                            return Some(handle);
                        }
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn intern_grow(&mut self) {
        let new_capacity = if self.intern.is_empty() { 8 } else { self.intern.len() * 2 };
        let old = std::mem::replace(&mut self.intern, vec![InternSlot::Empty; new_capacity]);
        self.intern_used = 0;
        let mut count = 0;
        for slot in old {
            if let InternSlot::Occupied(handle) = slot {
                if let ObjData::String(s) = self.get(handle) {
                    let hash = s.hash;
                    let cap = self.intern.len();
                    let mut index = (hash as usize) & (cap - 1);
                    while !matches!(self.intern[index], InternSlot::Empty) {
                        index = (index + 1) & (cap - 1);
                    }
                    self.intern[index] = InternSlot::Occupied(handle);
                    self.intern_used += 1;
                    count += 1;
                }
            }
        }
        self.intern_count = count;
    }

    fn intern_insert(&mut self, handle: Handle, hash: u32) {
        if self.intern.is_empty() || (self.intern_used + 1) as f64 / self.intern_capacity() as f64 > 0.75 {
            self.intern_grow();
        }
        let cap = self.intern_capacity();
        let mut index = (hash as usize) & (cap - 1);
        let mut first_tombstone = None;
        loop {
            match self.intern[index] {
                InternSlot::Empty => break,
                InternSlot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                InternSlot::Occupied(_) => {}
            }
            index = (index + 1) & (cap - 1);
        }
        let target = first_tombstone.unwrap_or(index);
        if matches!(self.intern[target], InternSlot::Empty) {
            self.intern_used += 1;
        }
        self.intern[target] = InternSlot::Occupied(handle);
        self.intern_count += 1;
    }

    /// Canonicalizes `bytes` into a single interned string object,
    /// returning the same handle every time it's called with equal
    /// bytes (§8 "Interning a string twice returns the same object").
    pub fn intern(&mut self, bytes: &[u8]) -> Handle {
        let hash = fnv1a(bytes);
        if let Some(handle) = self.find_interned(bytes, hash) {
            return handle;
        }
        let handle = self.alloc(ObjData::String(crate::object::ObjString {
            bytes: bytes.to_vec(),
            hash,
        }));
        self.intern_insert(handle, hash);
        handle
    }

    pub fn intern_str(&mut self, s: &str) -> Handle {
        self.intern(s.as_bytes())
    }

    /// §4.4 step 3: deletes any intern-table entry whose key object
    /// didn't survive marking. Must run after trace, before sweep,
    /// since sweep clears mark bits on survivors.
    fn intern_weak_sweep(&mut self) {
        for i in 0..self.intern.len() {
            if let InternSlot::Occupied(handle) = self.intern[i] {
                let marked = self.slots[handle.index()].as_ref().map(|s| s.marked).unwrap_or(false);
                if !marked {
                    self.intern[i] = InternSlot::Tombstone;
                    self.intern_count -= 1;
                }
            }
        }
    }

    // -- GC (§4.4) ------------------------------------------------------

    /// Marks an object live, pushing it onto the grey stack only the
    /// first time (§8 "Marking an already-marked object is a no-op").
    pub fn mark(&mut self, handle: Handle) {
        if let Some(slot) = self.slots[handle.index()].as_mut() {
            if slot.marked {
                return;
            }
            slot.marked = true;
            self.grey_stack.push(handle);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark(handle);
        }
    }

    fn children_of(&self, handle: Handle) -> Vec<Child> {
        match self.get(handle) {
            ObjData::String(_) => Vec::new(),
            ObjData::Function(f) => {
                let mut children: Vec<Child> = f.chunk.constants.iter().map(|v| Child::Value(*v)).collect();
                if let Some(name) = f.name {
                    children.push(Child::Handle(name));
                }
                children
            }
            ObjData::Closure(c) => {
                let mut children = vec![Child::Handle(c.function)];
                children.extend(c.upvalues.iter().map(|h| Child::Handle(*h)));
                children
            }
            ObjData::Upvalue(u) => match u.state {
                crate::object::UpvalueState::Open(_) => Vec::new(),
                crate::object::UpvalueState::Closed(v) => vec![Child::Value(v)],
            },
            ObjData::Class(c) => {
                let mut children = vec![Child::Handle(c.name)];
                children.extend(c.methods.iter().map(|(k, v)| [Child::Handle(k), Child::Handle(*v)]).flatten());
                children
            }
            ObjData::Instance(i) => {
                let mut children = vec![Child::Handle(i.class)];
                children.extend(i.fields.iter().map(|(k, v)| [Child::Handle(k), Child::Value(*v)]).flatten());
                children
            }
            ObjData::BoundMethod(b) => vec![Child::Value(b.receiver), Child::Handle(b.method)],
            ObjData::Native(n) => vec![Child::Handle(n.name)],
        }
    }

    /// Drains the grey stack, marking every object transitively
    /// reachable from whatever roots the caller already marked (§4.4
    /// step 2). Postcondition: grey stack empty, every reachable
    /// object marked (§8).
    pub fn trace(&mut self) {
        while let Some(handle) = self.grey_stack.pop() {
            for child in self.children_of(handle) {
                match child {
                    Child::Value(v) => self.mark_value(v),
                    Child::Handle(h) => self.mark(h),
                }
            }
        }
    }

    /// §4.4 step 4: unlinks and frees every unmarked object, clearing
    /// the mark bit on survivors. Must run after `intern_weak_sweep`.
    pub fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            match &mut self.slots[index] {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                }
                Some(slot) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.data.approx_size());
                    self.slots[index] = None;
                    self.free_list.push(index as u32);
                }
                None => {}
            }
        }
    }

    /// Runs the full collection cycle: traces from whatever roots the
    /// caller has already marked, then sweeps both the intern table
    /// and the heap, then grows the threshold (§4.4 step 5).
    pub fn collect(&mut self) {
        self.trace();
        self.intern_weak_sweep();
        self.sweep();
        self.next_gc = self.bytes_allocated * self.growth_factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use proptest::prelude::*;

    #[test]
    fn interning_same_bytes_returns_same_handle() {
        let mut heap = Heap::new(&Config::default());
        let a = heap.intern_str("hello");
        let b = heap.intern_str("hello");
        assert_eq!(a, b);
        let c = heap.intern_str("world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_object_is_collected_and_reused() {
        let mut heap = Heap::new(&Config::default());
        let garbage = heap.intern_str("garbage");
        // Nothing marks `garbage` as a root.
        heap.mark(heap.init_string);
        heap.collect();
        // The slot was freed; a later allocation may reuse its index,
        // but `garbage`'s *content* is no longer findable via interning.
        let _ = garbage;
        assert!(heap.find_interned(b"garbage", fnv1a(b"garbage")).is_none());
    }

    #[test]
    fn marking_keeps_object_alive_across_collect() {
        let mut heap = Heap::new(&Config::default());
        let kept = heap.intern_str("kept");
        heap.mark(heap.init_string);
        heap.mark(kept);
        heap.collect();
        assert_eq!(heap.intern_str("kept"), kept);
    }

    proptest! {
        /// Interning is idempotent for any byte string: re-interning the
        /// same bytes, any number of times, always returns the handle
        /// the first call produced (§4.3's "same bytes, same handle").
        #[test]
        fn interning_is_idempotent(bytes: Vec<u8>) {
            let mut heap = Heap::new(&Config::default());
            let first = heap.intern(&bytes);
            for _ in 0..4 {
                prop_assert_eq!(heap.intern(&bytes), first);
            }
        }

        /// Marking the same handle any number of times leaves the grey
        /// stack with exactly one entry for it, matching the single
        /// `push` in `mark` above.
        #[test]
        fn marking_is_idempotent(reps in 1usize..8) {
            let mut heap = Heap::new(&Config::default());
            let handle = heap.intern_str("x");
            for _ in 0..reps {
                heap.mark(handle);
            }
            prop_assert_eq!(heap.grey_stack.iter().filter(|h| **h == handle).count(), 1);
        }
    }
}
