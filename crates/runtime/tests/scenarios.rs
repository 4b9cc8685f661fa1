//! End-to-end checks for spec §8's "Concrete scenarios", at whatever level
//! this runtime core can actually exercise them.
//!
//! Three of the six scenarios name out-of-scope surface directly (Lily
//! source text, `List.push`/`print`, `Hash` subscript sugar) that only
//! exist once a front end and built-in library sit on top of this crate.
//! Those are adapted here to the equivalent core mechanics: container
//! mutation through `GetItem`/`SetItem` in place of `List.push`, and
//! `hash::set`/`hash::get`/`hash::remove`/`hash::iter_pairs` in place of
//! `Hash`'s bracket syntax and iteration sugar.
//!
//! The other three scenarios are already covered where the mechanics they
//! name actually live, so they are not repeated here:
//!   - try/except around a division by zero: `state::tests::a_failed_parse_leaves_a_readable_error_and_a_clean_vm`
//!     and `interp::tests::try_except_catches_a_raised_runtime_error`.
//!   - a coroutine yielding twice then completing: `coroutine::tests::resume_sequence_yields_then_completes`.
//!   - a two-container reference cycle reclaimed after an external-ref drop: `gc::tests::cyclic_pair_is_reclaimed_once_unreferenced`.

use std::cell::RefCell;
use std::rc::Rc;

use lily_core::heap::{Bytecode, ContainerKind, ContainerObj, FunctionObj};
use lily_core::value::Value;
use lily_runtime::interp::{Interpreter, Shared};

fn emit(code: &mut Bytecode, line: u16, tag: u16, operands: &[u16]) {
    code.push(line);
    code.push(tag);
    code.extend_from_slice(operands);
}

fn shared() -> Rc<RefCell<Shared>> {
    Rc::new(RefCell::new(Shared::new(1_000_000, 4, [0u8; 16])))
}

/// Scenario 1, adapted: `List.push` is a built-in method this crate never
/// defines, but the container mutation underneath it — growing past the
/// constructed length is the library body's job, writing into an existing
/// slot is this crate's — is exercised directly through `SetItem`/`GetItem`.
#[test]
fn a_built_list_is_mutated_and_read_back_through_core_opcodes() {
    let mut code: Bytecode = Vec::new();
    // BuildList dest=3 values_start=0 count=3 from regs [1,2,3] -> [1,2,3]
    emit(&mut code, 1, 28, &[3, 0, 3]);
    // SetItem container=3 index=4(reg holding 0) src=5(reg holding 99) -> [99,2,3]
    emit(&mut code, 1, 34, &[3, 4, 5]);
    // GetItem dest=6 container=3 index=4
    emit(&mut code, 1, 33, &[6, 3, 4]);
    emit(&mut code, 1, 25, &[6]);
    let f = Rc::new(RefCell::new(FunctionObj::native(7, code, "main", "mutate_list")));

    let mut vm = Interpreter::new(shared());
    let args = [
        Value::Integer(1),
        Value::Integer(2),
        Value::Integer(3),
        Value::Unit,
        Value::Integer(0),
        Value::Integer(99),
    ];
    let result = vm.execute(&f, &args).unwrap();
    assert_eq!(result.as_integer(), Some(99));
}

/// Scenario 2, adapted: two keys set, size checked, one removed, then
/// iteration yields exactly the surviving pair.
#[test]
fn a_hash_tracks_size_across_set_and_remove_and_iterates_what_remains() {
    use lily_core::heap::{HashObj, StringObj};
    use lily_runtime::hash;

    let sipkey = [0u8; 16];
    let mut table = HashObj::new(4);

    let key_a = Value::String(Rc::new(RefCell::new(StringObj::new("a".to_string()))));
    let key_b = Value::String(Rc::new(RefCell::new(StringObj::new("b".to_string()))));

    hash::set(&mut table, key_a.clone(), Value::Integer(1), &sipkey).unwrap();
    hash::set(&mut table, key_b.clone(), Value::Integer(2), &sipkey).unwrap();
    assert_eq!(table.num_entries(), 2);

    let removed = hash::remove(&mut table, &key_a, &sipkey).unwrap();
    assert!(removed);

    let remaining: Vec<i64> = hash::iter_pairs(&table)
        .map(|(_, v)| v.as_integer().unwrap())
        .collect();
    assert_eq!(remaining, vec![2]);
}

/// Scenario 4: a function that calls itself recursively 1000 times and
/// then raises at the bottom produces a traceback of at least 1000 frames.
/// `countdown(n)` is stashed as global 0 so each call can fetch "itself"
/// to recurse without a front end's notion of a named function reference;
/// `1` lives in the constant pool at slot 0 for the same reason — there is
/// no literal-loading opcode that doesn't go through `GetReadonly`.
#[test]
fn deep_recursion_produces_a_traceback_of_at_least_a_thousand_frames() {
    let mut code: Bytecode = Vec::new();
    // r0=n (arg), r1=1 (const), r2=0 (scratch), r3=n>0, r4=self, r5=n-1
    emit(&mut code, 1, 41, &[1, 0]); // GetReadonly dest=1 const_id=0  -> r1 = 1
    emit(&mut code, 1, 3, &[2, 0, 0]); // Arith Sub dest=2 left=0 right=0 -> r2 = 0
    emit(&mut code, 1, 16, &[3, 0, 2]); // Compare Greater dest=3 left=0 right=2 -> r3 = n>0
    emit(&mut code, 1, 19, &[3, 18]); // JumpIfFalse cond=3 offset=18 -> raise branch
    emit(&mut code, 1, 37, &[4, 0]); // GetGlobal dest=4 global_id=0 -> r4 = self
    emit(&mut code, 1, 3, &[5, 0, 1]); // Arith Sub dest=5 left=0 right=1 -> r5 = n-1
    emit(&mut code, 1, 23, &[4, 5, 1, 0]); // CallNative function=4 args_start=5 argc=1 dest=0
    emit(&mut code, 1, 25, &[0]); // ReturnVal src=0
    emit(&mut code, 1, 47, &[0]); // Raise src=0 (base case: n has bottomed out at 0)

    let f = Rc::new(RefCell::new(FunctionObj::native(6, code, "main", "countdown")));

    let shared = shared();
    shared.borrow_mut().constants.push(Value::Integer(1));
    shared.borrow_mut().globals.insert(0, Value::Function(Rc::clone(&f)));

    let mut vm = Interpreter::new(shared);
    let err = vm.execute(&f, &[Value::Integer(1000)]).unwrap_err();
    assert!(err.traceback.len() >= 1000, "expected >= 1000 frames, got {}", err.traceback.len());
}

/// `ContainerObj::new` starts a container at `ctor_progress == values.len()`
/// (already complete); this just pins that invariant at the integration
/// level since every opcode-built container above relies on it to be
/// immediately visible without a separate "finish construction" step.
#[test]
fn a_freshly_built_container_is_already_complete() {
    let obj = ContainerObj::new(ContainerKind::List, 0, vec![Value::Integer(1)]);
    assert!(obj.is_complete());
}
