//! The coroutine registry and active-VM chain (spec §4.8).
//!
//! `lily_core::heap::CoroutineObj` only carries an opaque `u64` handle — "the
//! core crate never interprets this, it only carries it alongside the
//! value." This is where that handle resolves to something: a
//! `coroutine::CoroutineEngine` is real, non-`Clone`, non-POD state (a
//! channel pair plus a spawned nested VM), so it cannot live inside the
//! `Value` the way the teacher's own strand bookkeeping lived inline on its
//! stack frames. It lives here instead, in a table owned by `Shared` and
//! reached through the handle.
//!
//! This also answers the question `coroutine::CoroutineEngine::resume`'s own
//! doc comment defers: "the interpreter ... is responsible for rejecting a
//! resume issued from inside the coroutine's own VM ... that requires
//! tracking the active-VM chain." `enter`/`is_active` are that chain — a
//! stack of handles currently mid-`resume`, checked before a nested call can
//! resume one of its own ancestors.
//!
//! Lily is single-threaded and cooperative (spec §5: "there is no
//! preemption"), so unlike the teacher's `StrandRegistry` this needs no
//! atomics, no lock-free slots, and no OS-thread-safety story at all — a
//! plain `HashMap` plus a `Vec` stack is the whole thing.

use std::collections::HashMap;

use crate::coroutine::CoroutineEngine;

/// Owns every live coroutine's behavior-half engine, keyed by the handle
/// stored on its `CoroutineObj`.
#[derive(Default)]
pub struct Scheduler {
    next_handle: u64,
    engines: HashMap<u64, CoroutineEngine>,
    active: Vec<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            next_handle: 1,
            engines: HashMap::new(),
            active: Vec::new(),
        }
    }

    /// Registers a freshly built engine and returns the handle to stash on
    /// its `CoroutineObj`. Handles are never reused within one `Scheduler`'s
    /// lifetime, so a stale handle left on a GC'd-away `CoroutineObj` can
    /// never alias a later coroutine's engine.
    pub fn register(&mut self, engine: CoroutineEngine) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.engines.insert(handle, engine);
        handle
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut CoroutineEngine> {
        self.engines.get_mut(&handle)
    }

    /// Drops the engine once its `CoroutineObj` is done and unreachable;
    /// called from the interpreter once a coroutine is known unreachable,
    /// not by the GC sweep directly, since the GC only knows `Value`s, not
    /// handles.
    pub fn remove(&mut self, handle: u64) -> Option<CoroutineEngine> {
        self.engines.remove(&handle)
    }

    /// Takes the engine out of the table for the duration of a `resume`
    /// call. The engine's nested VM shares `Shared` with its caller through
    /// the very `Rc<RefCell<Shared>>` this scheduler lives in, so the
    /// engine must not still be borrowed out of that `RefCell` while
    /// `resume` drives it — `checkout`/`checkin` bracket the call instead of
    /// handing back a borrowed reference.
    pub fn checkout(&mut self, handle: u64) -> Option<CoroutineEngine> {
        self.engines.remove(&handle)
    }

    /// Returns an engine taken out by `checkout` once its `resume` call
    /// returns.
    pub fn checkin(&mut self, handle: u64, engine: CoroutineEngine) {
        self.engines.insert(handle, engine);
    }

    /// True if `handle` is already somewhere up the active-resume chain —
    /// resuming it now would be a coroutine resuming itself.
    pub fn is_active(&self, handle: u64) -> bool {
        self.active.contains(&handle)
    }

    pub fn mark_active(&mut self, handle: u64) {
        self.active.push(handle);
    }

    /// Pops the most recently marked handle. Resumes bracket
    /// `mark_active`/`unmark_active` around a `checkout`/`checkin` pair, so
    /// these always unwind in strict last-in-first-out order with it.
    pub fn unmark_active(&mut self, handle: u64) {
        let popped = self.active.pop();
        debug_assert_eq!(popped, Some(handle), "active chain must unwind LIFO");
    }

    /// How many coroutines are currently mid-resume; surfaced by
    /// `diagnostics::dump_diagnostics`.
    pub fn active_depth(&self) -> usize {
        self.active.len()
    }

    pub fn live_count(&self) -> usize {
        self.engines.len()
    }
}
