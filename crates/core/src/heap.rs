//! Heap object layouts (spec §3's "Heap objects" table) and the GC entry
//! node. The collector algorithm itself (prepare/mark/sweep, thresholds)
//! lives in `lily-runtime::gc`; this module only defines the shapes it
//! walks and the content-only-destructor contract each shape must honor.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::value::Value;

/// One of the three states a GC-tagged object's entry can be in
/// (invariant c). `NotSeen` is the default for a freshly-prepared
/// generation; `Visited` means the marker reached it this generation;
/// `Sweep` means the collector has decided to reclaim it and is in the
/// middle of (or has finished) tearing down its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    NotSeen,
    Visited,
    Sweep,
}

/// Anything that can sit on the GC's intrusive `gc_live_entries` list.
/// Implemented by every heap shape that can be `IS_GC_TAGGED`: containers,
/// functions (closures with upvalues), and coroutines.
///
/// `clear_contents` is the "content-only destructor" from spec §9: it must
/// drop whatever `Value`s this object owns (so their own refcounts fall,
/// recursively freeing anything only reachable through the cycle) without
/// attempting to free `self` — `self` is still behind the caller's `Rc`
/// shell, and Rust's own drop glue reclaims it once the last strong
/// reference elsewhere in the (now-broken) cycle goes away.
pub trait GcObject {
    /// Invoke `mark` once for every `Value` directly owned by this object.
    /// The marker recurses by re-entering `mark_children` on any
    /// GC-tagged child reached through the closure.
    fn mark_children(&self, mark: &mut dyn FnMut(&Value));

    /// Content-only teardown: the sweep phase.
    fn clear_contents(&mut self);
}

/// `{flags, status, value_pointer, next}` from spec §3, minus `next` (the
/// intrusive list itself is a `Vec`/slab owned by `lily-runtime::gc`, not a
/// hand-linked list — see that module's grounding note).
pub struct GcEntry {
    pub status: GcStatus,
    /// Weak: the entry must never be the thing keeping an unreachable cycle
    /// alive. Ordinary ownership flows through the `Rc`s inside `Value`;
    /// this is strictly the collector's side channel for finding
    /// GC-tagged objects that the owner graph alone cannot reach.
    pub value: Weak<RefCell<dyn GcObject>>,
}

impl GcEntry {
    pub fn new(value: Weak<RefCell<dyn GcObject>>) -> Self {
        GcEntry {
            status: GcStatus::NotSeen,
            value,
        }
    }

    /// A shell whose backing object has already been dropped by ordinary
    /// refcounting; the sweep can skip it without visiting.
    pub fn is_stale(&self) -> bool {
        self.value.strong_count() == 0
    }
}

/// String heap object: `size` plus an owned, NUL-terminated-by-convention
/// buffer (Rust's `String` already carries its own length; the NUL
/// terminator from the original C layout has no Rust counterpart and is not
/// reproduced).
#[derive(Debug)]
pub struct StringObj {
    pub refcount: u32,
    pub data: String,
}

impl StringObj {
    pub fn new(data: String) -> Self {
        StringObj { refcount: 1, data }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

#[derive(Debug)]
pub struct ByteStringObj {
    pub refcount: u32,
    pub data: Vec<u8>,
}

impl ByteStringObj {
    pub fn new(data: Vec<u8>) -> Self {
        ByteStringObj { refcount: 1, data }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Shared layout for list, tuple, instance, and variant (spec §3: "Tuples
/// and instances share container layout; their `class_id` distinguishes
/// them"; lists and variants reuse the same shape for the same reason —
/// a contiguous span of values plus bookkeeping).
#[derive(Debug)]
pub struct ContainerObj {
    pub refcount: u32,
    pub kind: ContainerKind,
    pub class_id: u32,
    /// How many constructor slots have been written so far. An
    /// incomplete container (`ctor_progress < values.len()`) must never be
    /// made visible to the interpreter (spec §4.7 invariant).
    pub ctor_progress: usize,
    pub values: Vec<Value>,
    /// Extra unused capacity beyond `values.len()`, tracked separately so
    /// `push`'s growth policy (double until it fits) can be observed
    /// without relying on `Vec`'s own (unspecified) growth factor.
    pub extra_space: usize,
    pub gc_entry: Option<Rc<RefCell<GcEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    Tuple,
    Instance,
    Variant,
}

impl ContainerObj {
    pub fn new(kind: ContainerKind, class_id: u32, values: Vec<Value>) -> Self {
        let ctor_progress = values.len();
        ContainerObj {
            refcount: 1,
            kind,
            class_id,
            ctor_progress,
            values,
            extra_space: 0,
            gc_entry: None,
        }
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn is_complete(&self) -> bool {
        self.ctor_progress >= self.values.len()
    }
}

impl GcObject for ContainerObj {
    fn mark_children(&self, mark: &mut dyn FnMut(&Value)) {
        for v in &self.values {
            mark(v);
        }
    }

    fn clear_contents(&mut self) {
        self.values.clear();
        self.extra_space = 0;
    }
}

/// One bucket entry in a `Hash`'s chaining table.
#[derive(Debug)]
pub struct HashEntry {
    pub hash: u64,
    pub key: Value,
    pub record: Value,
}

#[derive(Debug)]
pub struct HashObj {
    pub refcount: u32,
    pub num_bins: usize,
    pub bins: Vec<Vec<HashEntry>>,
    /// Non-zero while a foreign or bytecode iteration is in progress;
    /// removal must raise rather than invalidate the iterator (spec §5).
    pub iter_count: u32,
    pub gc_entry: Option<Rc<RefCell<GcEntry>>>,
}

impl HashObj {
    pub fn new(num_bins: usize) -> Self {
        let num_bins = num_bins.max(1);
        HashObj {
            refcount: 1,
            num_bins,
            bins: (0..num_bins).map(|_| Vec::new()).collect(),
            iter_count: 0,
            gc_entry: None,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }
}

impl GcObject for HashObj {
    fn mark_children(&self, mark: &mut dyn FnMut(&Value)) {
        for bin in &self.bins {
            for entry in bin {
                mark(&entry.key);
                mark(&entry.record);
            }
        }
    }

    fn clear_contents(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
    }
}

#[derive(Debug)]
pub struct FileObj {
    pub refcount: u32,
    pub read_ok: bool,
    pub write_ok: bool,
    pub handle: Option<std::fs::File>,
    pub is_closed: bool,
}

impl FileObj {
    pub fn new(handle: std::fs::File, read_ok: bool, write_ok: bool) -> Self {
        FileObj {
            refcount: 1,
            read_ok,
            write_ok,
            handle: Some(handle),
            is_closed: false,
        }
    }

    pub fn close(&mut self) {
        self.handle = None;
        self.is_closed = true;
    }
}

/// Compiled bytecode, decoded into 16-bit words by the interpreter's
/// `opcode` module. Defined here only as an opaque buffer: emission is out
/// of scope, so this crate never constructs one except via the placeholder
/// assembler in `crates/cli`.
pub type Bytecode = Vec<u16>;

pub enum NativeFn {
    Foreign(Box<dyn Fn(&mut dyn std::any::Any) -> Result<(), crate::error::RaiseError>>),
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NativeFn(..)")
    }
}

#[derive(Debug)]
pub struct FunctionObj {
    pub refcount: u32,
    pub reg_count: u32,
    pub code: Option<Bytecode>,
    pub foreign: Option<NativeFn>,
    pub upvalues: Vec<Rc<RefCell<crate::value::Cell>>>,
    /// Module and function name, kept for traceback construction even
    /// though symbol-table/debug-info construction itself is out of scope.
    pub proto_module: String,
    pub proto_name: String,
    pub gc_entry: Option<Rc<RefCell<GcEntry>>>,
}

impl FunctionObj {
    pub fn native(reg_count: u32, code: Bytecode, module: &str, name: &str) -> Self {
        FunctionObj {
            refcount: 1,
            reg_count,
            code: Some(code),
            foreign: None,
            upvalues: Vec::new(),
            proto_module: module.to_string(),
            proto_name: name.to_string(),
            gc_entry: None,
        }
    }

    pub fn is_foreign(&self) -> bool {
        self.foreign.is_some()
    }
}

impl GcObject for FunctionObj {
    fn mark_children(&self, mark: &mut dyn std::ops::FnMut(&Value)) {
        for cell in &self.upvalues {
            mark(&cell.borrow().value);
        }
    }

    fn clear_contents(&mut self) {
        self.upvalues.clear();
        self.code = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Running,
    Waiting,
    Done,
    Failed,
}

/// The nested-VM handle itself is opaque here (`lily-runtime::coroutine`
/// owns the actual interpreter state); this struct only carries the parts
/// the value model and GC need to see.
#[derive(Debug)]
pub struct CoroutineObj {
    pub refcount: u32,
    pub class_id: u32,
    pub base_function: Value,
    pub receiver: Option<Value>,
    pub status: CoroutineStatus,
    pub gc_entry: Option<Rc<RefCell<GcEntry>>>,
    /// Opaque handle into `lily-runtime::coroutine`'s registry; the core
    /// crate never interprets this, it only carries it alongside the value.
    pub handle: u64,
}

impl GcObject for CoroutineObj {
    fn mark_children(&self, mark: &mut dyn FnMut(&Value)) {
        mark(&self.base_function);
        if let Some(r) = &self.receiver {
            mark(r);
        }
    }

    fn clear_contents(&mut self) {
        self.receiver = None;
        self.handle = 0;
    }
}

pub struct ForeignObj {
    pub refcount: u32,
    pub class_id: u32,
    pub destroy: Option<Box<dyn FnMut(&mut dyn std::any::Any)>>,
    pub data: Box<dyn std::any::Any>,
}

impl std::fmt::Debug for ForeignObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignObj")
            .field("class_id", &self.class_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_starts_complete_when_built_from_a_full_span() {
        let c = ContainerObj::new(ContainerKind::List, 0, vec![Value::Integer(1)]);
        assert!(c.is_complete());
    }

    #[test]
    fn clear_contents_drops_children() {
        let mut c = ContainerObj::new(ContainerKind::List, 0, vec![Value::Integer(1)]);
        c.clear_contents();
        assert_eq!(c.num_values(), 0);
    }

    #[test]
    fn hash_num_entries_sums_bins() {
        let mut h = HashObj::new(4);
        h.bins[0].push(HashEntry {
            hash: 0,
            key: Value::Integer(1),
            record: Value::Integer(2),
        });
        assert_eq!(h.num_entries(), 1);
    }

    #[test]
    fn stale_entry_detects_dropped_backing_object() {
        let container: Rc<RefCell<dyn GcObject>> =
            Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, vec![])));
        let weak = Rc::downgrade(&container);
        let entry = GcEntry::new(weak);
        assert!(!entry.is_stale());
        drop(container);
        assert!(entry.is_stale());
    }
}
