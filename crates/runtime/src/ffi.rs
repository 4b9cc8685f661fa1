//! The foreign call interface (spec §4.7/§6): argument fetching, value
//! pushing, return-slot writes, re-entrant calls back into Lily code, and
//! exception signaling for code written outside the interpreter.
//!
//! Grounded on the teacher's `closures.rs` FFI-context style — panic on a
//! contract violation (wrong-kind `arg_<kind>`, out-of-range index) rather
//! than a recoverable error, since a foreign function's own argument types
//! are fixed by its registration and a mismatch there is a caller bug, not
//! a dynamic condition — and on `original_source/src/lily_api_value.c`'s
//! symmetric `lily_arg_*`/`lily_push_*`/`lily_return_*` family per base
//! type (`SPEC_FULL` §12).
//!
//! Dynaload's lazy module-loading protocol is out of scope (spec's
//! Non-goals list); `module_register`/`find_function` here are a plain
//! name-to-function table, not the info-table/loader machinery that would
//! back real dynamic module import.

use std::collections::HashMap;
use std::rc::Rc;

use lily_core::error::RaiseError;
use lily_core::heap::{
    ByteStringObj, ContainerObj, CoroutineObj, FileObj, ForeignObj, FunctionObj, HashObj, StringObj,
};
use lily_core::value::Value;

use crate::frame::RegisterStack;

/// Anything that can execute a re-entrant call back into Lily code on
/// behalf of a foreign function. Implemented by `interp::Interpreter`;
/// kept as a trait here so `ffi` never depends on `interp` directly.
pub trait VmInvoker {
    fn invoke(&mut self, function: &Value, args: &[Value]) -> Result<Value, RaiseError>;
}

/// A plain name-to-function table backing `module_register`/`find_function`
/// (spec §6's embedding operations), without dynaload's lazy-loading
/// protocol.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, HashMap<String, Value>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    pub fn module_register(&mut self, module: &str, functions: Vec<(String, Value)>) {
        let entry = self.modules.entry(module.to_string()).or_default();
        for (name, function) in functions {
            entry.insert(name, function);
        }
    }

    pub fn find_function(&self, module: &str, name: &str) -> Option<Value> {
        self.modules.get(module)?.get(name).cloned()
    }
}

/// The context a foreign function body sees. One is built per foreign call
/// from the active frame's argument window and dropped at the end of the
/// call; it never outlives the call.
pub struct ForeignContext<'a> {
    registers: &'a mut RegisterStack,
    args_start: usize,
    argc: usize,
    return_slot: Option<usize>,
    invoker: &'a mut dyn VmInvoker,
    modules: &'a mut ModuleRegistry,
    /// Scratch buffer backing both `push_<kind>` and the `call_prepare`/
    /// `call`/`call_result` re-entrant call protocol.
    pending: Vec<Value>,
    last_result: Option<Value>,
}

macro_rules! arg_accessor {
    ($name:ident, $variant:ident, $heap:ty) => {
        pub fn $name(&self, i: usize) -> Rc<std::cell::RefCell<$heap>> {
            match self.arg_raw(i) {
                Value::$variant(r) => r,
                other => panic!(
                    concat!(stringify!($name), ": argument {} is not a ", stringify!($variant), " (got {:?})"),
                    i,
                    other.base()
                ),
            }
        }
    };
}

impl<'a> ForeignContext<'a> {
    pub fn new(
        registers: &'a mut RegisterStack,
        args_start: usize,
        argc: usize,
        return_slot: Option<usize>,
        invoker: &'a mut dyn VmInvoker,
        modules: &'a mut ModuleRegistry,
    ) -> Self {
        ForeignContext {
            registers,
            args_start,
            argc,
            return_slot,
            invoker,
            modules,
            pending: Vec::new(),
            last_result: None,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.argc
    }

    fn arg_raw(&self, i: usize) -> Value {
        assert!(i < self.argc, "arg index {i} out of range ({} args)", self.argc);
        self.registers.get(self.args_start + i).clone()
    }

    pub fn arg_integer(&self, i: usize) -> i64 {
        self.arg_raw(i)
            .as_integer()
            .unwrap_or_else(|| panic!("arg_integer: argument {i} is not an Integer"))
    }

    pub fn arg_double(&self, i: usize) -> f64 {
        self.arg_raw(i)
            .as_double()
            .unwrap_or_else(|| panic!("arg_double: argument {i} is not a Double"))
    }

    pub fn arg_boolean(&self, i: usize) -> bool {
        self.arg_raw(i)
            .as_boolean()
            .unwrap_or_else(|| panic!("arg_boolean: argument {i} is not a Boolean"))
    }

    pub fn arg_byte(&self, i: usize) -> u8 {
        match self.arg_raw(i) {
            Value::Byte(b) => b,
            other => panic!("arg_byte: argument {i} is not a Byte (got {:?})", other.base()),
        }
    }

    arg_accessor!(arg_string, String, StringObj);
    arg_accessor!(arg_bytestring, ByteString, ByteStringObj);
    arg_accessor!(arg_list, List, ContainerObj);
    arg_accessor!(arg_tuple, Tuple, ContainerObj);
    arg_accessor!(arg_instance, Instance, ContainerObj);
    arg_accessor!(arg_variant, Variant, ContainerObj);
    arg_accessor!(arg_hash, Hash, HashObj);
    arg_accessor!(arg_file, File, FileObj);
    arg_accessor!(arg_function, Function, FunctionObj);
    arg_accessor!(arg_coroutine, Coroutine, CoroutineObj);

    /// `arg_generic`: the opaque-value escape hatch for foreign values that
    /// don't fit any built-in kind.
    pub fn arg_generic(&self, i: usize) -> Rc<std::cell::RefCell<ForeignObj>> {
        match self.arg_raw(i) {
            Value::Foreign(r) => r,
            other => panic!("arg_generic: argument {i} is not Foreign (got {:?})", other.base()),
        }
    }

    /// `arg_isa(i, class_id)`: exact class check; subclasses do not match.
    pub fn arg_isa(&self, i: usize, class_id: u32) -> bool {
        self.arg_raw(i).class_id() == Some(class_id)
    }

    /// `optional_<kind>(i, default)`: keyword-arg holes fall back to
    /// `default` rather than indexing out of range.
    pub fn optional_integer(&self, i: usize, default: i64) -> i64 {
        if i < self.argc {
            self.arg_integer(i)
        } else {
            default
        }
    }

    pub fn optional_double(&self, i: usize, default: f64) -> f64 {
        if i < self.argc {
            self.arg_double(i)
        } else {
            default
        }
    }

    pub fn optional_boolean(&self, i: usize, default: bool) -> bool {
        if i < self.argc {
            self.arg_boolean(i)
        } else {
            default
        }
    }

    /// `push_<kind>`: grows the active scratch window by one value. Used
    /// both to stage arguments for a re-entrant `call` and, via
    /// `return_top`, to hand back a freshly built value.
    pub fn push(&mut self, value: Value) {
        self.pending.push(value);
    }

    pub fn push_integer(&mut self, v: i64) {
        self.push(Value::Integer(v));
    }

    pub fn push_double(&mut self, v: f64) {
        self.push(Value::Double(v));
    }

    pub fn push_boolean(&mut self, v: bool) {
        self.push(Value::Boolean(v));
    }

    pub fn push_byte(&mut self, v: u8) {
        self.push(Value::Byte(v));
    }

    /// `return_<kind>`: writes into the caller-reserved return slot,
    /// dropping (decref'ing) whatever was there via `Value::assign`.
    pub fn return_value(&mut self, value: Value) {
        if let Some(slot) = self.return_slot {
            self.registers.set(slot, value);
        }
    }

    pub fn return_integer(&mut self, v: i64) {
        self.return_value(Value::Integer(v));
    }

    pub fn return_double(&mut self, v: f64) {
        self.return_value(Value::Double(v));
    }

    pub fn return_boolean(&mut self, v: bool) {
        self.return_value(Value::Boolean(v));
    }

    pub fn return_unit(&mut self) {
        self.return_value(Value::Unit);
    }

    /// `return_top`: flushes the most recently `push`ed value into the
    /// return slot — the common "build then return" pattern for foreign
    /// functions that stage a container through several `push_<kind>`
    /// calls and hand back only the last one.
    pub fn return_top(&mut self) {
        if let Some(top) = self.pending.last().cloned() {
            self.return_value(top);
        }
    }

    /// `call_prepare`: starts a fresh re-entrant call, discarding any
    /// scratch values staged by a prior `push_<kind>` run.
    pub fn call_prepare(&mut self) {
        self.pending.clear();
        self.last_result = None;
    }

    /// `call`: invokes `function` with every value staged via `push_<kind>`
    /// since the last `call_prepare`.
    pub fn call(&mut self, function: &Value) -> Result<(), RaiseError> {
        let result = self.invoker.invoke(function, &self.pending)?;
        self.last_result = Some(result);
        Ok(())
    }

    /// `call_result`: retrieves the value returned by the most recent
    /// `call`.
    pub fn call_result(&self) -> Option<Value> {
        self.last_result.clone()
    }

    pub fn raise_value_error(&self, message: impl Into<String>) -> RaiseError {
        RaiseError::new(lily_core::error::ExceptionClass::ValueError, message)
    }

    pub fn raise_index_error(&self, index: i64, len: usize) -> RaiseError {
        RaiseError::index_out_of_range(index, len)
    }

    pub fn raise_key_error(&self) -> RaiseError {
        RaiseError::key_not_found()
    }

    pub fn raise_io_error(&self, message: impl Into<String>) -> RaiseError {
        RaiseError::new(lily_core::error::ExceptionClass::IOError, message)
    }

    pub fn raise_runtime_error(&self, message: impl Into<String>) -> RaiseError {
        RaiseError::runtime(message)
    }

    pub fn module_register(&mut self, module: &str, functions: Vec<(String, Value)>) {
        self.modules.module_register(module, functions);
    }

    pub fn find_function(&self, module: &str, name: &str) -> Option<Value> {
        self.modules.find_function(module, name)
    }
}

/// Bridges `ForeignContext`'s borrowed lifetime across `NativeFn::Foreign`'s
/// `&mut dyn Any` boundary, which requires `Self: 'static` to downcast.
/// Same "pointer as usize" trick `coroutine.rs` uses to cross
/// `may::coroutine::spawn`'s `Send` boundary: the pointer itself is
/// trivially `'static` even though what it points to is not.
pub struct ForeignCallBridge(usize);

impl ForeignCallBridge {
    /// Safe to build because `call_foreign` uses the bridge for exactly one
    /// foreign call and drops it, along with `ctx`, before returning —
    /// the raw pointer never outlives the borrow it was taken from.
    pub fn new(ctx: &mut ForeignContext<'_>) -> Self {
        ForeignCallBridge(ctx as *mut ForeignContext<'_> as usize)
    }

    /// Reconstructs the borrow and hands it to `f`. Relies on the same
    /// "used once, within the call that built it" invariant as `new`.
    pub fn with<R>(&mut self, f: impl FnOnce(&mut ForeignContext<'_>) -> R) -> R {
        let ctx = unsafe { &mut *(self.0 as *mut ForeignContext<'_>) };
        f(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::error::ExceptionClass;

    struct EchoInvoker;
    impl VmInvoker for EchoInvoker {
        fn invoke(&mut self, _function: &Value, args: &[Value]) -> Result<Value, RaiseError> {
            Ok(args.first().cloned().unwrap_or(Value::Unit))
        }
    }

    fn setup(args: Vec<Value>) -> (RegisterStack, ModuleRegistry) {
        let mut regs = RegisterStack::new();
        regs.reserve_through(args.len() + 1);
        for (i, v) in args.into_iter().enumerate() {
            regs.init(i, v);
        }
        (regs, ModuleRegistry::new())
    }

    #[test]
    fn arg_integer_reads_from_the_argument_window() {
        let (mut regs, mut modules) = setup(vec![Value::Integer(42), Value::Boolean(true)]);
        let mut invoker = EchoInvoker;
        let ctx = ForeignContext::new(&mut regs, 0, 2, Some(2), &mut invoker, &mut modules);
        assert_eq!(ctx.arg_integer(0), 42);
        assert!(ctx.arg_boolean(1));
    }

    #[test]
    #[should_panic(expected = "is not an Integer")]
    fn arg_integer_panics_on_kind_mismatch() {
        let (mut regs, mut modules) = setup(vec![Value::Boolean(true)]);
        let mut invoker = EchoInvoker;
        let ctx = ForeignContext::new(&mut regs, 0, 1, None, &mut invoker, &mut modules);
        ctx.arg_integer(0);
    }

    #[test]
    fn optional_falls_back_to_default_past_arg_count() {
        let (mut regs, mut modules) = setup(vec![Value::Integer(1)]);
        let mut invoker = EchoInvoker;
        let ctx = ForeignContext::new(&mut regs, 0, 1, None, &mut invoker, &mut modules);
        assert_eq!(ctx.optional_integer(0, 99), 1);
        assert_eq!(ctx.optional_integer(1, 99), 99);
    }

    #[test]
    fn return_integer_writes_the_return_slot() {
        let (mut regs, mut modules) = setup(vec![Value::Unit, Value::Unit]);
        let mut invoker = EchoInvoker;
        let mut ctx = ForeignContext::new(&mut regs, 0, 0, Some(1), &mut invoker, &mut modules);
        ctx.return_integer(7);
        drop(ctx);
        assert_eq!(regs.get(1).as_integer(), Some(7));
    }

    #[test]
    fn call_prepare_call_result_round_trips_through_invoker() {
        let (mut regs, mut modules) = setup(vec![Value::Unit]);
        let mut invoker = EchoInvoker;
        let mut ctx = ForeignContext::new(&mut regs, 0, 0, None, &mut invoker, &mut modules);
        ctx.call_prepare();
        ctx.push_integer(5);
        ctx.call(&Value::Unit).unwrap();
        assert_eq!(ctx.call_result().unwrap().as_integer(), Some(5));
    }

    #[test]
    fn module_register_and_find_function_round_trip() {
        let (mut regs, mut modules) = setup(vec![]);
        let mut invoker = EchoInvoker;
        let mut ctx = ForeignContext::new(&mut regs, 0, 0, None, &mut invoker, &mut modules);
        ctx.module_register("math", vec![("sqrt".to_string(), Value::Integer(1))]);
        assert!(ctx.find_function("math", "sqrt").is_some());
        assert!(ctx.find_function("math", "missing").is_none());
    }

    #[test]
    fn raise_helpers_produce_the_right_class() {
        let (mut regs, mut modules) = setup(vec![]);
        let mut invoker = EchoInvoker;
        let ctx = ForeignContext::new(&mut regs, 0, 0, None, &mut invoker, &mut modules);
        assert_eq!(ctx.raise_value_error("bad").class, ExceptionClass::ValueError);
        assert_eq!(ctx.raise_key_error().class, ExceptionClass::KeyError);
    }
}
