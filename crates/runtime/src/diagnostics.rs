//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps runtime statistics to
//! stderr, similar to JVM thread dumps. Useful for debugging a stuck
//! embedder process without stopping it.
//!
//! ## Usage
//!
//! Send SIGQUIT to a running process:
//! ```bash
//! kill -3 <pid>
//! ```
//!
//! The process dumps diagnostics to stderr and continues running.
//!
//! A signal handler can't be handed a `&State` at delivery time, so
//! `State::new` registers a weak pointer to its `Shared` in a thread-local
//! slot; the dump upgrades it and reports "no state" rather than crashing
//! once that `State` is gone. Since a `State` is not `Send`/`Sync` (spec §5:
//! not safe to share across threads), this is a `thread_local!`, not the
//! teacher's global `static` — good enough for the single-thread-per-state
//! model the rest of this crate assumes throughout.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Once;

use crate::interp::Shared;

static SIGNAL_HANDLER_INIT: Once = Once::new();

thread_local! {
    static CURRENT: RefCell<Option<Weak<RefCell<Shared>>>> = const { RefCell::new(None) };
}

/// Points the diagnostics dump at `shared`, replacing whatever `State` was
/// previously registered on this thread. Called from `State::new`.
pub fn register_current(shared: &Rc<RefCell<Shared>>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(Rc::downgrade(shared)));
}

/// Install the SIGQUIT signal handler for diagnostics.
///
/// Safe to call multiple times (idempotent).
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                // SIGQUIT = 3, same as the JVM's kill -3 thread dump.
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }

        #[cfg(not(unix))]
        {
            // No signal handling outside Unix; dump_diagnostics() can still
            // be called directly.
        }
    });
}

/// Dump runtime diagnostics to stderr.
///
/// Can be called directly or triggered via SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Lily Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    CURRENT.with(|c| match c.borrow().as_ref().and_then(Weak::upgrade) {
        Some(shared) => {
            let shared = shared.borrow();
            let _ = writeln!(out, "\n[GC]");
            let _ = writeln!(out, "  Live tagged entries: {}", shared.gc.live_count());
            let _ = writeln!(out, "  Collect threshold:   {}", shared.gc.threshold());
            let _ = writeln!(out, "\n[Coroutines]");
            let _ = writeln!(out, "  Registered: {}", shared.scheduler.live_count());
            let _ = writeln!(out, "  Active (mid-resume): {}", shared.scheduler.active_depth());
        }
        None => {
            let _ = writeln!(out, "\n(no live State registered on this thread)");
        }
    });

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}
