// File: src/heap.rs
//
// Object heap and the tracing garbage collector's machinery.
// Collection is mark-sweep with a tri-color invariant: white objects are
// unreached, the gray worklist holds reached objects whose children are
// pending, and black objects are marked and off the worklist. The VM
// drives a cycle (it owns the roots); the heap owns marking, tracing,
// and sweeping.

use std::mem;

use crate::object::{Obj, ObjKind};
use crate::value::Value;

/// Collection threshold for a fresh heap.
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// Handle to a heap object. Copyable and compared by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

pub struct Heap {
    /// Object slab. Freed slots are `None` and reusable.
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    /// Head of the intrusive all-objects list used by the sweep phase.
    objects: Option<ObjRef>,
    /// Gray worklist for the mark phase.
    gray: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// Collect on every allocation when set.
    pub stress: bool,
    pub log: bool,
    /// In-progress compiler functions; they are roots because a cycle can
    /// run in the middle of compilation.
    compiler_roots: Vec<ObjRef>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            objects: None,
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            stress: std::env::var("LOX_STRESS_GC").is_ok(),
            log: std::env::var("LOX_LOG_GC").is_ok(),
            compiler_roots: Vec::new(),
        }
    }

    /// True when the next allocation should run a collection first.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Insert a new object into the slab and thread it onto the
    /// all-objects list. Never collects; the VM decides when to collect
    /// before calling this.
    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let size = object_size(&kind);
        let obj = Obj { kind, is_marked: false, next: self.objects, size };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                index
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };
        let r = ObjRef(index);
        self.objects = Some(r);
        self.bytes_allocated += size;
        if self.log {
            eprintln!("[gc] allocate {:?} ({} bytes)", r, size);
        }
        r
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize] {
            Some(obj) => obj,
            None => panic!("use of freed heap object"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize] {
            Some(obj) => obj,
            None => panic!("use of freed heap object"),
        }
    }

    // Typed accessors. A kind mismatch is an interpreter bug, not a user
    // error, and aborts.

    pub fn string(&self, r: ObjRef) -> &crate::object::StringObj {
        match &self.get(r).kind {
            ObjKind::String(s) => s,
            _ => panic!("heap handle is not a string"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::FunctionObj {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            _ => panic!("heap handle is not a function"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut crate::object::FunctionObj {
        match &mut self.get_mut(r).kind {
            ObjKind::Function(f) => f,
            _ => panic!("heap handle is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ClosureObj {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            _ => panic!("heap handle is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::ClosureObj {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            _ => panic!("heap handle is not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::UpvalueObj {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("heap handle is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::UpvalueObj {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("heap handle is not an upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::ClassObj {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            _ => panic!("heap handle is not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::InstanceObj {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            _ => panic!("heap handle is not an instance"),
        }
    }

    pub fn is_closure(&self, r: ObjRef) -> bool {
        matches!(self.get(r).kind, ObjKind::Closure(_))
    }

    pub fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.get(r).kind, ObjKind::String(_))
    }

    /// Returns the native's function pointer if the handle is a native.
    pub fn native_fn(&self, r: ObjRef) -> Option<crate::object::NativeFn> {
        match &self.get(r).kind {
            ObjKind::Native(n) => Some(n.function),
            _ => None,
        }
    }

    // Mark phase.

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// White -> gray: set the mark flag and enqueue for tracing.
    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.get_mut(r);
        if obj.is_marked {
            return;
        }
        obj.is_marked = true;
        self.gray.push(r);
    }

    pub fn mark_compiler_roots(&mut self) {
        for i in 0..self.compiler_roots.len() {
            let r = self.compiler_roots[i];
            self.mark_object(r);
        }
    }

    pub fn push_compiler_root(&mut self, r: ObjRef) {
        self.compiler_roots.push(r);
    }

    pub fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// outgoing references gray.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Children are gathered first so marking can re-borrow the slab.
        let mut refs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match &self.get(r).kind {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    refs.push(name);
                }
                values.extend(f.chunk.constants.iter().copied());
            }
            ObjKind::Closure(c) => {
                refs.push(c.function);
                refs.extend(c.upvalues.iter().copied());
            }
            ObjKind::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(value) = u.state {
                    values.push(value);
                }
            }
            ObjKind::Class(c) => {
                refs.push(c.name);
                for (key, value) in c.methods.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
            ObjKind::Instance(i) => {
                refs.push(i.class);
                for (key, value) in i.fields.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
        }
        for child in refs {
            self.mark_object(child);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    /// Walk the all-objects list: free white objects, whiten black ones
    /// for the next cycle. Returns the number of bytes reclaimed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.objects;
        while let Some(r) = cursor {
            let next = self.get(r).next;
            if self.get(r).is_marked {
                self.get_mut(r).is_marked = false;
                prev = Some(r);
            } else {
                match prev {
                    Some(p) => self.get_mut(p).next = next,
                    None => self.objects = next,
                }
                freed += self.free_object(r);
            }
            cursor = next;
        }
        freed
    }

    fn free_object(&mut self, r: ObjRef) -> usize {
        let obj = self.slots[r.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("double free of heap object"));
        self.bytes_allocated -= obj.size;
        self.free.push(r.0);
        if self.log {
            eprintln!("[gc] free {:?} ({} bytes)", r, obj.size);
        }
        obj.size
    }

    // Rendering.

    pub fn format_object(&self, r: ObjRef) -> String {
        match &self.get(r).kind {
            ObjKind::String(s) => s.chars.to_string(),
            ObjKind::Function(f) => self.format_function(f.name),
            ObjKind::Closure(c) => self.format_function(self.function(c.function).name),
            ObjKind::Upvalue(_) => "upvalue".to_string(),
            ObjKind::Class(c) => self.string(c.name).chars.to_string(),
            ObjKind::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).chars)
            }
            ObjKind::Native(_) => "<native fn>".to_string(),
        }
    }

    fn format_function(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(n) => format!("<fn {}>", self.string(n).chars),
            None => "<script>".to_string(),
        }
    }

    // Introspection used by tests and the GC log.

    pub fn live_objects(&self) -> Vec<ObjRef> {
        let mut out = Vec::new();
        let mut cursor = self.objects;
        while let Some(r) = cursor {
            out.push(r);
            cursor = self.get(r).next;
        }
        out
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.get(r).is_marked
    }

    pub fn gray_is_empty(&self) -> bool {
        self.gray.is_empty()
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots[r.0 as usize].is_some()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte count charged for an object at allocation time. The same number
/// is credited back when the object is freed, so the accounting that
/// paces collection stays balanced.
fn object_size(kind: &ObjKind) -> usize {
    let base = mem::size_of::<Obj>();
    base + match kind {
        ObjKind::String(s) => s.chars.len(),
        ObjKind::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * mem::size_of::<usize>()
                + f.chunk.constants.capacity() * mem::size_of::<Value>()
        }
        ObjKind::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
        ObjKind::Class(c) => c.methods.byte_size(),
        ObjKind::Instance(i) => i.fields.byte_size(),
        ObjKind::Upvalue(_) | ObjKind::Native(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{hash_string, StringObj};

    fn alloc_str(heap: &mut Heap, s: &str) -> ObjRef {
        heap.allocate(ObjKind::String(StringObj {
            chars: s.into(),
            hash: hash_string(s),
        }))
    }

    #[test]
    fn test_allocate_links_all_objects_list() {
        let mut heap = Heap::new();
        let a = alloc_str(&mut heap, "a");
        let b = alloc_str(&mut heap, "b");
        assert_eq!(heap.live_objects(), vec![b, a]);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_whitens_marked() {
        let mut heap = Heap::new();
        let a = alloc_str(&mut heap, "a");
        let b = alloc_str(&mut heap, "b");
        heap.mark_object(a);
        heap.trace_references();
        let freed = heap.sweep();
        assert!(freed > 0);
        assert!(heap.is_live(a));
        assert!(!heap.is_live(b));
        assert!(!heap.is_marked(a));
        assert!(heap.gray_is_empty());
        assert_eq!(heap.live_objects(), vec![a]);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = alloc_str(&mut heap, "a");
        heap.sweep();
        let b = alloc_str(&mut heap, "b");
        assert_eq!(a, b);
        assert_eq!(heap.string(b).chars.as_ref(), "b");
    }

    #[test]
    fn test_bytes_allocated_balances() {
        let mut heap = Heap::new();
        alloc_str(&mut heap, "transient");
        assert!(heap.bytes_allocated > 0);
        heap.sweep();
        assert_eq!(heap.bytes_allocated, 0);
    }
}
