//! Jump stack and exception raising (spec §4.4), translated from the
//! original's `setjmp`/`longjmp` chain into explicit `Result` propagation
//! per the Design Notes guidance — a raise is simply `Err(RaiseError)`
//! bubbling up through `?` until something matches it, rather than a
//! non-local jump. `Raiser` keeps the bookkeeping (call-depth at entry,
//! source kind, error-callback stacks) that the original attached to each
//! jump buffer.

use lily_core::error::RaiseError;

use crate::frame::CallFrame;

/// Where a jump record was opened from. Kept even though this crate never
/// itself lexes or parses — the embedding API opens `Parse`/`Lex`/`Emit`
/// records around calls into the (external) front end so a raise from
/// those phases still unwinds through the same stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpSource {
    Parse,
    Lex,
    Emit,
    Vm,
    Raw,
}

#[derive(Debug)]
pub struct JumpRecord {
    pub call_depth: usize,
    pub source: JumpSource,
    pub pending_error: Option<RaiseError>,
}

type ErrorCallback = Box<dyn FnMut()>;

/// The interpreter's jump/exception manager. Not global: one `Raiser` per
/// `State`, and coroutines open their own nested chain (spec §9: "no
/// hidden global state").
pub struct Raiser {
    jumps: Vec<JumpRecord>,
    /// One callback stack per live call frame, indexed the same way the
    /// frame stack is. A foreign function's `error_callback_push`/`_pop`
    /// operate on `callbacks.last_mut()`.
    callbacks: Vec<Vec<ErrorCallback>>,
}

impl Default for Raiser {
    fn default() -> Self {
        Self::new()
    }
}

impl Raiser {
    pub fn new() -> Self {
        Raiser {
            jumps: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn push_jump(&mut self, call_depth: usize, source: JumpSource) {
        self.jumps.push(JumpRecord {
            call_depth,
            source,
            pending_error: None,
        });
    }

    pub fn pop_jump(&mut self) -> Option<JumpRecord> {
        self.jumps.pop()
    }

    pub fn jump_depth(&self) -> usize {
        self.jumps.len()
    }

    pub fn top_jump(&self) -> Option<&JumpRecord> {
        self.jumps.last()
    }

    /// A coroutine may only yield when its own nested jump stack has
    /// exactly two records: the base frame opened by `build`, and the main
    /// loop's own entry. A foreign call pushes a third, making yield
    /// illegal (spec §4.8).
    pub fn has_exactly_two_records(&self) -> bool {
        self.jumps.len() == 2
    }

    pub fn enter_frame(&mut self) {
        self.callbacks.push(Vec::new());
    }

    /// Pops the current frame's callback stack without firing it — the
    /// normal-exit path, where cleanup already ran explicitly via `_pop`.
    pub fn exit_frame(&mut self) {
        self.callbacks.pop();
    }

    pub fn push_error_callback(&mut self, cb: ErrorCallback) {
        if let Some(top) = self.callbacks.last_mut() {
            top.push(cb);
        }
    }

    pub fn pop_error_callback(&mut self) {
        if let Some(top) = self.callbacks.last_mut() {
            top.pop();
        }
    }

    /// Fires every pending callback in frames being unwound past
    /// `target_depth`, LIFO within a frame, innermost frame first. Called
    /// by the interpreter while propagating a raise back to a handler's
    /// recorded call depth.
    pub fn unwind_callbacks_to(&mut self, target_depth: usize) {
        while self.callbacks.len() > target_depth {
            if let Some(mut frame_cbs) = self.callbacks.pop() {
                while let Some(mut cb) = frame_cbs.pop() {
                    cb();
                }
            }
        }
    }

    /// Builds the `(module, function, line)` traceback by walking the
    /// frame stack, innermost first, and attaches it to `err`. Takes an
    /// iterator rather than a slice so a `FramePool`-backed call stack
    /// (whose live frames aren't necessarily contiguous in the pool's own
    /// storage) can supply frames without first collecting them.
    pub fn attach_traceback<'a>(
        &self,
        err: &mut RaiseError,
        frames: impl DoubleEndedIterator<Item = &'a CallFrame>,
    ) {
        err.traceback = frames
            .rev()
            .map(|f| (f.module.clone(), f.function.clone(), f.line))
            .collect();
    }

    /// Raises from the VM: builds the traceback from the live frame stack
    /// and returns the error for the caller to propagate with `?`.
    pub fn raise_vm<'a>(
        &self,
        frames: impl DoubleEndedIterator<Item = &'a CallFrame>,
        mut err: RaiseError,
    ) -> RaiseError {
        self.attach_traceback(&mut err, frames);
        err
    }

    pub fn raise_raw(&self, err: RaiseError) -> RaiseError {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::error::ExceptionClass;

    #[test]
    fn two_jump_records_enables_yield() {
        let mut r = Raiser::new();
        assert!(!r.has_exactly_two_records());
        r.push_jump(0, JumpSource::Raw);
        r.push_jump(0, JumpSource::Vm);
        assert!(r.has_exactly_two_records());
        r.push_jump(0, JumpSource::Vm);
        assert!(!r.has_exactly_two_records());
    }

    #[test]
    fn callbacks_fire_lifo_on_unwind() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let log = Rc::new(RefCell::new(Vec::new()));
        let mut r = Raiser::new();
        r.enter_frame();
        r.enter_frame();
        let l1 = Rc::clone(&log);
        r.push_error_callback(Box::new(move || l1.borrow_mut().push("a")));
        let l2 = Rc::clone(&log);
        r.push_error_callback(Box::new(move || l2.borrow_mut().push("b")));

        r.unwind_callbacks_to(0);
        assert_eq!(*log.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn traceback_is_innermost_first() {
        let r = Raiser::new();
        let frames = vec![
            CallFrame::test_frame("main", "f", 10),
            CallFrame::test_frame("main", "g", 20),
        ];
        let err = RaiseError::new(ExceptionClass::RuntimeError, "boom");
        let err = r.raise_vm(frames.iter(), err);
        assert_eq!(err.traceback[0].1, "g");
        assert_eq!(err.traceback[1].1, "f");
    }
}
