//! The tagged value representation (spec §3's "Value"). Modeled as a Rust
//! enum rather than a packed 16-byte record per the Design Notes: the
//! compiler already gives exhaustiveness and the heap variants already
//! carry their own discriminant through `Rc`'s vtable-free tag, so nothing
//! is lost by not packing `flags`/`cell_refcount`/payload into one word.
//! `base()` and `flags()` still give O(1) branchless-equivalent type tests
//! for the interpreter's hot path.

use std::cell::RefCell;
use std::rc::Rc;

use crate::flags::{Base, ValueFlags};
use crate::heap::{ByteStringObj, ContainerObj, CoroutineObj, FileObj, ForeignObj, FunctionObj, HashObj, StringObj};

#[derive(Debug, Clone)]
pub enum Value {
    Integer(i64),
    Double(f64),
    Byte(u8),
    Boolean(bool),
    Unit,
    /// A variant with no payload (e.g. `None`); carries only its class id.
    EmptyVariant(u32),
    /// The "no value yet" state for an uninitialized register slot. Not
    /// the same thing as `Unit` — reading an `Unset` register is a VM bug,
    /// not a valid Lily value.
    Unset,

    String(Rc<RefCell<StringObj>>),
    ByteString(Rc<RefCell<ByteStringObj>>),
    Function(Rc<RefCell<FunctionObj>>),
    List(Rc<RefCell<ContainerObj>>),
    Tuple(Rc<RefCell<ContainerObj>>),
    Instance(Rc<RefCell<ContainerObj>>),
    Variant(Rc<RefCell<ContainerObj>>),
    Hash(Rc<RefCell<HashObj>>),
    File(Rc<RefCell<FileObj>>),
    Coroutine(Rc<RefCell<CoroutineObj>>),
    Foreign(Rc<RefCell<ForeignObj>>),
}

impl Value {
    pub fn base(&self) -> Base {
        match self {
            Value::Integer(_) => Base::Integer,
            Value::Double(_) => Base::Double,
            Value::Byte(_) => Base::Byte,
            Value::Boolean(_) => Base::Boolean,
            Value::Unit => Base::Unit,
            Value::EmptyVariant(_) => Base::EmptyVariant,
            Value::Unset => Base::Unset,
            Value::String(_) => Base::String,
            Value::ByteString(_) => Base::ByteString,
            Value::Function(_) => Base::Function,
            Value::List(_) => Base::List,
            Value::Tuple(_) => Base::Tuple,
            Value::Instance(_) => Base::Instance,
            Value::Variant(_) => Base::Variant,
            Value::Hash(_) => Base::Hash,
            Value::File(_) => Base::File,
            Value::Coroutine(_) => Base::Coroutine,
            Value::Foreign(_) => Base::Foreign,
        }
    }

    pub fn flags(&self) -> ValueFlags {
        self.base().flags()
    }

    pub fn is_derefable(&self) -> bool {
        self.base().is_derefable()
    }

    /// Strong-reference count of the backing heap object, or `1` for
    /// primitives (matching spec invariant b: primitives never carry a
    /// refcount, but reporting 1 keeps call sites that don't special-case
    /// primitives simple).
    pub fn refcount(&self) -> usize {
        match self {
            Value::String(r) => Rc::strong_count(r),
            Value::ByteString(r) => Rc::strong_count(r),
            Value::Function(r) => Rc::strong_count(r),
            Value::List(r) | Value::Tuple(r) | Value::Instance(r) | Value::Variant(r) => {
                Rc::strong_count(r)
            }
            Value::Hash(r) => Rc::strong_count(r),
            Value::File(r) => Rc::strong_count(r),
            Value::Coroutine(r) => Rc::strong_count(r),
            Value::Foreign(r) => Rc::strong_count(r),
            _ => 1,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<Rc<RefCell<StringObj>>> {
        match self {
            Value::String(s) => Some(Rc::clone(s)),
            _ => None,
        }
    }

    /// `copy(src)`: an incref, not a deep clone (spec §4.1). Primitives are
    /// moved by value anyway so there's nothing to incref.
    pub fn copy(&self) -> Value {
        self.clone()
    }

    /// `assign(dst, src)`: the deref/incref protocol collapses to ordinary
    /// Rust assignment here — `*dst = src.copy()` drops the old `dst`
    /// (decref, freeing at 0 via `Rc`'s own `Drop`) and clones `src`'s `Rc`
    /// (incref) before overwriting. Kept as a named method so call sites
    /// read the same as the spec's contract.
    pub fn assign(dst: &mut Value, src: &Value) {
        *dst = src.copy();
    }

    /// Class id for container-shaped values (list/tuple/instance/variant),
    /// used by `arg_isa`'s exact-class check and by container equality's
    /// "matching class_id" requirement.
    pub fn class_id(&self) -> Option<u32> {
        match self {
            Value::List(r) | Value::Tuple(r) | Value::Instance(r) | Value::Variant(r) => {
                Some(r.borrow().class_id)
            }
            Value::EmptyVariant(class_id) => Some(*class_id),
            Value::Coroutine(r) => Some(r.borrow().class_id),
            Value::Foreign(r) => Some(r.borrow().class_id),
            _ => None,
        }
    }
}

/// A heap-allocated, separately-refcounted value cell used for closure
/// upvalues (spec §4.5). `cell_refcount` in the original layout; here the
/// `Rc` wrapping the cell (not the cell's own field) supplies that count,
/// so `Cell` itself only needs to hold the value.
#[derive(Debug, Clone)]
pub struct Cell {
    pub value: Value,
}

impl Cell {
    pub fn new(value: Value) -> Self {
        Cell { value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ContainerKind, ContainerObj};

    #[test]
    fn primitive_refcount_is_one() {
        assert_eq!(Value::Integer(5).refcount(), 1);
        assert_eq!(Value::Boolean(true).refcount(), 1);
    }

    #[test]
    fn assign_drops_previous_and_shares_new() {
        let list = Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::List,
            0,
            vec![Value::Integer(1)],
        )));
        let src = Value::List(Rc::clone(&list));
        let mut dst = Value::Unit;
        Value::assign(&mut dst, &src);
        assert_eq!(src.refcount(), 2);
        drop(dst);
        assert_eq!(src.refcount(), 1);
    }

    #[test]
    fn base_matches_variant() {
        assert_eq!(Value::Integer(0).base(), Base::Integer);
        assert_eq!(Value::Unset.base(), Base::Unset);
    }
}
