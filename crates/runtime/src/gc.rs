//! The mark/sweep collector (spec §4.3), grounded on
//! `original_source/src/lily_gc.c`'s tri-state bookkeeping: entries that
//! survive a generation stay `Visited`, entries nobody reached flip to
//! `Sweep` and have their contents torn down before the entry is recycled.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use lily_core::heap::{GcEntry, GcObject, GcStatus};
use lily_core::value::Value;

/// Owns the intrusive list of GC-tagged objects and the adaptive
/// threshold that decides when to run. One per `State`.
///
/// Spare `GcEntry` reuse (spec §3's `gc_spare_entries`) is demonstrated on
/// its own in `pool::GcEntryPool`; the collector itself keeps entries
/// behind `Rc<RefCell<_>>` so callers that registered an object (and so
/// hold the same entry handle, e.g. a container's own `gc_entry` field)
/// keep observing its status transition to `Sweep` in place rather than
/// racing a move into a separate free list.
pub struct Collector {
    live: Vec<Rc<RefCell<GcEntry>>>,
    live_count: usize,
    threshold: usize,
    multiplier: usize,
}

impl Collector {
    pub fn new(gc_start: usize, multiplier: usize) -> Self {
        Collector {
            live: Vec::new(),
            live_count: 0,
            threshold: gc_start,
            multiplier: multiplier.max(1),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Registers a freshly `IS_GC_TAGGED` object and returns its entry.
    /// Per spec §4.3, call this only after `maybe_collect` has had a
    /// chance to run, so the new tag never crosses the threshold itself.
    ///
    /// Generic over the concrete heap type so registering never needs an
    /// extra strong `Rc<RefCell<dyn GcObject>>` clone just to have
    /// something to downgrade — `Weak<RefCell<T>>` unsizes to
    /// `Weak<RefCell<dyn GcObject>>` directly.
    pub fn register<T: GcObject + 'static>(&mut self, object: &Rc<RefCell<T>>) -> Rc<RefCell<GcEntry>> {
        let weak: Weak<RefCell<dyn GcObject>> = Rc::downgrade(object);
        let entry = Rc::new(RefCell::new(GcEntry::new(weak)));
        self.live.push(Rc::clone(&entry));
        self.live_count += 1;
        entry
    }

    /// Checks the threshold and, if exceeded, runs a full collection
    /// before the caller attaches a new tag (spec §4.3: "once exceeded, a
    /// full mark/sweep runs before the offending tag is attached").
    pub fn maybe_collect(&mut self, roots: &[Value]) {
        if self.live_count >= self.threshold {
            let freed = self.collect(roots);
            if freed == 0 {
                self.threshold = self.threshold.saturating_mul(self.multiplier).max(1);
            }
        }
    }

    /// Runs prepare/mark/sweep unconditionally (used by `force_collect`
    /// and by the adaptive check above) and returns how many entries were
    /// reclaimed.
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        self.prepare();
        self.mark(roots);
        self.sweep()
    }

    fn prepare(&mut self) {
        for entry in &self.live {
            entry.borrow_mut().status = GcStatus::NotSeen;
        }
    }

    fn mark(&mut self, roots: &[Value]) {
        for root in roots {
            mark_value(root);
        }
    }

    /// Every entry still `NotSeen` is unreachable from the roots (it may
    /// still be part of a cycle). Its contents are cleared and its status
    /// flips to `Sweep` in place — observable through any other handle on
    /// the same `Rc<RefCell<GcEntry>>` — then it is dropped from `live`;
    /// the backing object's `Rc` shell is left for ordinary drop glue,
    /// which fires once every remaining strong reference (including the
    /// ones other swept entries just dropped) is gone.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut still_live = Vec::with_capacity(self.live.len());

        for entry in self.live.drain(..) {
            let is_stale = entry.borrow().is_stale();
            let unreached = entry.borrow().status == GcStatus::NotSeen;

            if is_stale || unreached {
                if !is_stale {
                    if let Some(obj) = entry.borrow().value.upgrade() {
                        obj.borrow_mut().clear_contents();
                    }
                }
                entry.borrow_mut().status = GcStatus::Sweep;
                freed += 1;
                self.live_count -= 1;
                continue;
            }

            still_live.push(entry);
        }

        self.live = still_live;
        freed
    }
}

fn mark_value(value: &Value) {
    match value {
        Value::List(r) | Value::Tuple(r) | Value::Instance(r) | Value::Variant(r) => {
            mark_container(r);
        }
        Value::Hash(r) => mark_generic(r),
        Value::Function(r) => mark_generic(r),
        Value::Coroutine(r) => mark_generic(r),
        _ => {}
    }
}

fn mark_container(obj: &Rc<RefCell<lily_core::heap::ContainerObj>>) {
    if let Some(gc) = &obj.borrow().gc_entry {
        let mut entry = gc.borrow_mut();
        if entry.status == GcStatus::Visited {
            return;
        }
        entry.status = GcStatus::Visited;
    }
    let children: Vec<Value> = obj.borrow().values.clone();
    for child in &children {
        mark_value(child);
    }
}

fn mark_generic<T: GcObject + 'static>(obj: &Rc<RefCell<T>>) {
    let mut collected = Vec::new();
    obj.borrow().mark_children(&mut |v| collected.push(v.clone()));
    for v in &collected {
        mark_value(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::heap::{ContainerKind, ContainerObj};

    fn tagged_list(values: Vec<Value>) -> (Value, Rc<RefCell<GcEntry>>, Collector) {
        let mut gc = Collector::new(4, 4);
        let container = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, values)));
        let entry = gc.register(&container);
        container.borrow_mut().gc_entry = Some(Rc::clone(&entry));
        (Value::List(container), entry, gc)
    }

    #[test]
    fn unreachable_tagged_object_is_swept() {
        let (value, entry, mut gc) = tagged_list(vec![Value::Integer(1)]);
        drop(value);
        let freed = gc.collect(&[]);
        assert_eq!(freed, 1);
        assert_eq!(entry.borrow().status, GcStatus::Sweep);
    }

    #[test]
    fn reachable_tagged_object_survives() {
        let (value, _entry, mut gc) = tagged_list(vec![Value::Integer(1)]);
        let freed = gc.collect(&[value.clone()]);
        assert_eq!(freed, 0);
        assert_eq!(gc.live_count(), 1);
    }

    #[test]
    fn idempotent_sweep_never_frees_twice() {
        let (value, _entry, mut gc) = tagged_list(vec![Value::Integer(1)]);
        drop(value);
        let first = gc.collect(&[]);
        let second = gc.collect(&[]);
        assert_eq!(first, 1);
        assert_eq!(second, 0, "second sweep should find nothing left from the first");
    }

    #[test]
    fn cyclic_pair_is_reclaimed_once_unreferenced() {
        let mut gc = Collector::new(100, 4);
        let a = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, vec![])));
        let b = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, vec![])));

        let a_entry = gc.register(&a);
        let b_entry = gc.register(&b);
        a.borrow_mut().gc_entry = Some(Rc::clone(&a_entry));
        b.borrow_mut().gc_entry = Some(Rc::clone(&b_entry));

        a.borrow_mut().values.push(Value::List(Rc::clone(&b)));
        b.borrow_mut().values.push(Value::List(Rc::clone(&a)));

        // external refs still held via `a`/`b` vars — simulate dropping
        // them but keep the registry copies, matching scenario 6.
        let before = gc.live_count();
        drop(a);
        drop(b);

        let freed = gc.collect(&[]);
        assert_eq!(freed, 2, "both halves of the cycle should be collected");
        assert_eq!(gc.live_count(), before - 2);
    }
}
