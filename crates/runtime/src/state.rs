//! The embedding API (spec §4.9): `new_state(config) → (load_* → parse_* /
//! render_* / validate_*)* → free_state`, grounded directly on
//! `original_source/src/lily.h`'s `lily_config`/`lily_new_state`/
//! `lily_parse_*`/`lily_error_message*`/`lily_free_state` family, since no
//! teacher file covers an embedding surface of its own (the teacher's
//! `compiler`/`lsp`/`repl` crates are themselves the front end, out of
//! scope here).
//!
//! Lexing, parsing, and bytecode emission are out of scope, so the
//! `load_*`/`parse_*` split the original draws between "open a source" and
//! "compile and run it" collapses here: `load_function` takes an
//! already-compiled `Function` (as the out-of-scope front end, or the
//! placeholder assembler in `crates/cli`, would hand the state once it
//! finished), and `parse_loaded`/`render_loaded` run it. Template rendering
//! (`render_func`) is an explicit Non-goal; the config slot is still
//! carried (spec's ambient surface), just never invoked.

use std::cell::RefCell;
use std::rc::Rc;

use lily_core::error::RaiseError;
use lily_core::heap::FunctionObj;
use lily_core::msgbuf::MsgBuf;
use lily_core::value::Value;

use crate::diagnostics;
use crate::interp::{Interpreter, Shared};

/// `lily_render_func`: called with each chunk of template literal output.
/// Carried in `Config` per spec §4.9 even though template mode itself is a
/// Non-goal — nothing in this crate invokes it.
pub type RenderFunc = Box<dyn FnMut(&str)>;

/// `lily_import_func`: invoked after built-in module resolution fails for a
/// name, so an embedder can supply its own module lookup. Dynaload's
/// lazy-loading protocol is out of scope; an embedder wiring this up is
/// expected to call `State::module_register` from inside the callback
/// rather than returning a lazy loader table.
pub type ImportFunc = Box<dyn FnMut(&str)>;

/// Configuration for a `State` (spec §4.9's enumerated options, matching
/// `original_source/src/lily.h`'s `lily_config` field-for-field). Built with
/// `Config::default()` and overridden field-by-field, the teacher's
/// plain-struct-with-documented-defaults convention (see
/// `examples/navicore-cem3/crates/runtime/src/watchdog.rs`'s
/// `WatchdogConfig`) rather than a builder macro.
pub struct Config {
    /// Exposed to `sys.argv`; `sys`'s own body is out of scope, so nothing
    /// in this crate reads this back — it is here for an embedder to wire
    /// into a foreign `sys` module it registers itself.
    pub argv: Vec<String>,
    /// Initial GC threshold (object count, not byte size). Default chosen
    /// the way the original's `lily_config_init` picks one: small enough to
    /// exercise collection in short-lived programs.
    pub gc_start: usize,
    /// Threshold multiplier applied when a sweep frees nothing.
    pub gc_multiplier: usize,
    pub render_func: Option<RenderFunc>,
    pub import_func: Option<ImportFunc>,
    /// Siphash key for `Hash` containers. Zeroed by default; an embedder
    /// that cares about hash-flooding resistance across untrusted input
    /// should set a real key before the first `Hash` is built; the decision
    /// to not reach for a `rand` dependency just to fill this in is
    /// recorded in `DESIGN.md`.
    pub sipkey: [u8; 16],
    /// Opaque passthrough handed to `render_func`/`import_func`. Kept as
    /// `Box<dyn Any>` rather than a raw pointer (the original's `void *`)
    /// since this crate never needs to touch it, only hold it.
    pub data: Option<Box<dyn std::any::Any>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            argv: Vec::new(),
            gc_start: 100,
            gc_multiplier: 4,
            render_func: None,
            import_func: None,
            sipkey: [0u8; 16],
            data: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }
}

/// One embeddable interpreter instance: the state lifecycle spec §4.9
/// describes. Not `Send`/`Sync` (matches spec §5's "a state is not safe to
/// share across threads").
pub struct State {
    config: Config,
    shared: Rc<RefCell<Shared>>,
    vm: Interpreter,
    loaded: Option<Rc<RefCell<FunctionObj>>>,
    last_error: Option<RaiseError>,
    /// Backs `error_message`/`error_message_no_trace` (spec's "latest
    /// formatted error from the state's message buffer").
    msgbuf: MsgBuf,
}

impl State {
    /// `lily_new_state`.
    pub fn new(config: Config) -> Self {
        let shared = Rc::new(RefCell::new(Shared::new(
            config.gc_start,
            config.gc_multiplier,
            config.sipkey,
        )));
        diagnostics::install_signal_handler();
        diagnostics::register_current(&shared);
        State {
            config,
            vm: Interpreter::new(Rc::clone(&shared)),
            shared,
            loaded: None,
            last_error: None,
            msgbuf: MsgBuf::new(),
        }
    }

    /// `lily_config_get`.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Registers foreign functions under a module name, the way an
    /// out-of-scope built-in library (`math`, `fs`, ...) would at startup,
    /// or an embedder's own foreign API.
    pub fn module_register(&mut self, module: &str, functions: Vec<(String, Value)>) {
        self.shared.borrow_mut().modules.module_register(module, functions);
    }

    /// Stands in for `lily_open_string`/`lily_open_file`: takes an
    /// already-compiled `Function` as this state's current load target.
    /// Replaces whatever was previously loaded, mirroring the original's
    /// "only fails if another open has already succeeded" rule by simply
    /// not allowing two loads to be pending at once — the second `load_*`
    /// always wins.
    pub fn load_function(&mut self, function: Rc<RefCell<FunctionObj>>) {
        self.loaded = Some(function);
        self.last_error = None;
    }

    /// `lily_parse_file`/`lily_parse_string`: runs the loaded function to
    /// completion with `args`. Returns `true`/`false` for the original's
    /// `1`/`0`; the "next pass rewinds broken state first" guarantee holds
    /// for free here, since `Interpreter::call_native` always pops its call
    /// frame and jump record on the way out, success or raise — there is no
    /// broken state left behind to rewind.
    pub fn parse_loaded(&mut self, args: &[Value]) -> bool {
        let Some(function) = self.loaded.clone() else {
            self.last_error = Some(RaiseError::runtime("parse: no function has been loaded."));
            return false;
        };
        match self.vm.execute(&function, args) {
            Ok(_) => {
                self.last_error = None;
                true
            }
            Err(e) => {
                self.last_error = Some(e);
                false
            }
        }
    }

    /// `lily_render_file`/`lily_render_string`. Template mode is an
    /// explicit Non-goal; this always fails without touching the VM,
    /// leaving `render_func` purely a carried config slot.
    pub fn render_loaded(&mut self) -> bool {
        self.last_error = Some(RaiseError::runtime(
            "render: template mode is not implemented by this runtime core.",
        ));
        false
    }

    /// Confirms the loaded function actually has a runnable body (native
    /// code or a foreign pointer) before a caller bothers with
    /// `parse_loaded`. Bytecode well-formedness beyond that is not checked
    /// here — compiled code is trusted per spec's Non-goals.
    pub fn validate_loaded(&mut self) -> bool {
        match &self.loaded {
            Some(f) => {
                let f = f.borrow();
                if f.code.is_some() || f.foreign.is_some() {
                    self.last_error = None;
                    true
                } else {
                    self.last_error = Some(RaiseError::runtime("validate: loaded function has no body."));
                    false
                }
            }
            None => {
                self.last_error = Some(RaiseError::runtime("validate: no function has been loaded."));
                false
            }
        }
    }

    /// `lily_error_message`.
    pub fn error_message(&mut self) -> Option<String> {
        let msgbuf = &mut self.msgbuf;
        self.last_error.as_ref().map(|e| e.format_with_trace(msgbuf))
    }

    /// `lily_error_message_no_trace`.
    pub fn error_message_no_trace(&mut self) -> Option<String> {
        let msgbuf = &mut self.msgbuf;
        self.last_error.as_ref().map(|e| e.format_no_trace(msgbuf))
    }

    /// Re-entrant call into an arbitrary `Function` value, the entry point
    /// `ForeignContext::call` uses under the hood and that an embedder can
    /// also reach directly (e.g. calling a callback value handed back from
    /// Lily code).
    pub fn call(&mut self, function: &Value, args: &[Value]) -> Result<Value, RaiseError> {
        match function {
            Value::Function(f) => self.vm.execute(f, args),
            other => Err(RaiseError::runtime(format!(
                "call: not a Function value (got {:?}).",
                other.base()
            ))),
        }
    }

    /// Forces a full mark/sweep over `roots` regardless of the adaptive
    /// threshold (spec §8 scenario 6: "after dropping external references
    /// and forcing a GC..."), returning how many entries were reclaimed.
    pub fn force_collect(&mut self, roots: &[Value]) -> usize {
        self.shared.borrow_mut().gc.collect(roots)
    }

    pub fn live_entry_count(&self) -> usize {
        self.shared.borrow().gc.live_count()
    }

    pub fn shared(&self) -> Rc<RefCell<Shared>> {
        Rc::clone(&self.shared)
    }

    /// `lily_free_state`. Most of the teardown here is ordinary `Drop`
    /// glue (`Interpreter`, `Shared`'s `Collector`, and every `Rc` they
    /// hold unwind themselves); this exists only for symmetry with the
    /// explicit lifecycle spec §4.9 names, the same way the teacher's own
    /// `diagnostics.rs` dump is an explicit call rather than relying on
    /// ambient signal state.
    pub fn free(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::heap::Bytecode;

    fn emit(code: &mut Bytecode, line: u16, tag: u16, operands: &[u16]) {
        code.push(line);
        code.push(tag);
        code.extend_from_slice(operands);
    }

    fn add_function() -> Rc<RefCell<FunctionObj>> {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 2, &[1, 0, 1]); // Arith Add dest=1 left=0 right=1
        emit(&mut code, 1, 25, &[1]); // ReturnVal src=1
        Rc::new(RefCell::new(FunctionObj::native(2, code, "main", "add")))
    }

    #[test]
    fn new_state_has_nothing_loaded() {
        let mut state = State::new(Config::default());
        assert!(!state.validate_loaded());
        assert!(state.error_message().is_some());
    }

    #[test]
    fn load_then_parse_runs_the_function() {
        let mut state = State::new(Config::default());
        state.load_function(add_function());
        assert!(state.validate_loaded());
        assert!(state.parse_loaded(&[Value::Integer(5), Value::Integer(5)]));
        assert!(state.error_message().is_none());
    }

    #[test]
    fn a_failed_parse_leaves_a_readable_error_and_a_clean_vm() {
        let mut code: Bytecode = Vec::new();
        emit(&mut code, 1, 5, &[0, 0, 1]); // Arith Div dest=0 left=0 right=1
        emit(&mut code, 1, 25, &[0]);
        let f = Rc::new(RefCell::new(FunctionObj::native(2, code, "main", "divz")));

        let mut state = State::new(Config::default());
        state.load_function(f.clone());
        assert!(!state.parse_loaded(&[Value::Integer(1), Value::Integer(0)]));
        assert!(state.error_message().unwrap().contains("DivisionByZeroError"));
        assert!(!state.error_message_no_trace().unwrap().contains("from "));

        // The VM left no broken call/jump state behind; a second pass over
        // the same function runs cleanly.
        state.load_function(f);
        assert!(!state.parse_loaded(&[Value::Integer(1), Value::Integer(0)]));
    }

    #[test]
    fn render_is_unimplemented_by_design() {
        let mut state = State::new(Config::default());
        assert!(!state.render_loaded());
        assert!(state.error_message_no_trace().unwrap().contains("template mode"));
    }

    #[test]
    fn force_collect_reclaims_an_unreferenced_tagged_list() {
        use lily_core::heap::{ContainerKind, ContainerObj};

        let mut state = State::new(Config::default());
        let obj = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, vec![])));
        let entry = state.shared().borrow_mut().gc.register(&obj);
        obj.borrow_mut().gc_entry = Some(entry);
        assert_eq!(state.live_entry_count(), 1);

        drop(obj);
        let freed = state.force_collect(&[]);
        assert_eq!(freed, 1);
        assert_eq!(state.live_entry_count(), 0);
    }
}
