//! Upvalue cells and closure construction (spec §4.5/§6), grounded on the
//! teacher's `closures.rs` environment-capture helpers, adapted from a raw
//! pointer env array to `Rc<RefCell<Cell>>` cells per spec §3/§9: "cells are
//! separately refcounted so closures can share them," destroyed when their
//! own refcount reaches zero independently of the wrapped value's refcount.

use std::cell::RefCell;
use std::rc::Rc;

use lily_core::heap::FunctionObj;
use lily_core::value::{Cell, Value};

use crate::frame::CallFrame;

/// `o_make_cell`: promotes a local to a cell sharing storage with every
/// closure built over it. The cell's own refcount is just the strong count
/// of the `Rc` wrapping it — no separate field is needed for it.
pub fn make_cell(value: Value) -> Rc<RefCell<Cell>> {
    Rc::new(RefCell::new(Cell { value }))
}

/// `get_upvalue`: reads the cell at `idx` in the current frame's snapshot.
pub fn get_upvalue(frame: &CallFrame, idx: usize) -> Value {
    frame.upvalues[idx].borrow().value.copy()
}

/// `set_upvalue`: writes through the cell, visible to every other closure
/// sharing it.
pub fn set_upvalue(frame: &CallFrame, idx: usize, value: Value) {
    let cell = &frame.upvalues[idx];
    Value::assign(&mut cell.borrow_mut().value, &value);
}

/// Where a `make_function` opcode's upvalue list pulls each cell from: a
/// local just promoted in the current frame via `make_cell`, or one already
/// captured by the enclosing function (threaded straight through rather
/// than re-promoted).
pub enum UpvalueSource {
    Local(Rc<RefCell<Cell>>),
    Outer(usize),
}

/// `make_function`: wraps a static function template (its bytecode, arity,
/// and proto identity) with a snapshot of upvalue cells resolved from
/// `sources`, producing the closure instance pushed to a register.
/// The template and the closure share the same `code`; only the upvalue
/// snapshot differs per closure instance.
pub fn make_closure(
    template: &Rc<RefCell<FunctionObj>>,
    sources: &[UpvalueSource],
    enclosing: &CallFrame,
) -> FunctionObj {
    let upvalues = sources
        .iter()
        .map(|src| match src {
            UpvalueSource::Local(cell) => Rc::clone(cell),
            UpvalueSource::Outer(idx) => Rc::clone(&enclosing.upvalues[*idx]),
        })
        .collect();

    let t = template.borrow();
    FunctionObj {
        refcount: 1,
        reg_count: t.reg_count,
        code: t.code.clone(),
        foreign: None,
        upvalues,
        proto_module: t.proto_module.clone(),
        proto_name: t.proto_name.clone(),
        gc_entry: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::heap::FunctionObj;

    fn frame_with_upvalues(cells: Vec<Rc<RefCell<Cell>>>) -> CallFrame {
        let mut f = CallFrame::test_frame("main", "f", 1);
        f.upvalues = cells;
        f
    }

    #[test]
    fn upvalue_read_write_is_visible_through_shared_cell() {
        let cell = make_cell(Value::Integer(1));
        let frame = frame_with_upvalues(vec![Rc::clone(&cell)]);
        assert_eq!(get_upvalue(&frame, 0).as_integer(), Some(1));

        set_upvalue(&frame, 0, Value::Integer(2));
        assert_eq!(cell.borrow().value.as_integer(), Some(2));
    }

    #[test]
    fn two_closures_over_the_same_local_share_the_cell() {
        let cell = make_cell(Value::Integer(10));
        let template = Rc::new(RefCell::new(FunctionObj::native(
            2,
            vec![],
            "main",
            "adder",
        )));
        let enclosing = CallFrame::test_frame("main", "outer", 1);

        let a = make_closure(&template, &[UpvalueSource::Local(Rc::clone(&cell))], &enclosing);
        let b = make_closure(&template, &[UpvalueSource::Local(Rc::clone(&cell))], &enclosing);

        a.upvalues[0].borrow_mut().value = Value::Integer(99);
        assert_eq!(b.upvalues[0].borrow().value.as_integer(), Some(99));
    }

    #[test]
    fn outer_source_threads_enclosing_cell_without_repromoting() {
        let outer_cell = make_cell(Value::Integer(5));
        let enclosing = frame_with_upvalues(vec![Rc::clone(&outer_cell)]);
        let template = Rc::new(RefCell::new(FunctionObj::native(1, vec![], "main", "inner")));

        let closure = make_closure(&template, &[UpvalueSource::Outer(0)], &enclosing);
        assert!(Rc::ptr_eq(&closure.upvalues[0], &outer_cell));
    }
}
