//! Recursive value equality (spec §4.1/§4.9's "Ordering & tie-breaks"):
//! identity for primitives, byte-equal for strings, elementwise for
//! containers, entrywise for hashes, all depth-bounded against reference
//! cycles the way the original source's `lily_value_equal` guards its own
//! recursion.

use lily_core::error::RaiseError;
use lily_core::value::Value;

const MAX_DEPTH: usize = 100;

/// `values_equal(a, b)`: the public entry point, starting the depth
/// counter at zero.
pub fn values_equal(a: &Value, b: &Value) -> Result<bool, RaiseError> {
    equal_at_depth(a, b, 0)
}

fn equal_at_depth(a: &Value, b: &Value, depth: usize) -> Result<bool, RaiseError> {
    if depth > MAX_DEPTH {
        return Err(RaiseError::runtime("Infinite loop in comparison."));
    }

    Ok(match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Byte(x), Value::Byte(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Unit, Value::Unit) => true,
        (Value::Unset, Value::Unset) => true,
        // Bit-equality, not `==`, so NaN compares equal to itself and
        // +0.0/-0.0 compare unequal, matching "no epsilon" literally.
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        (Value::EmptyVariant(x), Value::EmptyVariant(y)) => x == y,

        (Value::String(x), Value::String(y)) => x.borrow().data == y.borrow().data,
        (Value::ByteString(x), Value::ByteString(y)) => x.borrow().data == y.borrow().data,

        (Value::List(x), Value::List(y))
        | (Value::Tuple(x), Value::Tuple(y))
        | (Value::Instance(x), Value::Instance(y))
        | (Value::Variant(x), Value::Variant(y)) => {
            let (xb, yb) = (x.borrow(), y.borrow());
            if xb.class_id != yb.class_id || xb.num_values() != yb.num_values() {
                false
            } else {
                let (xs, ys) = (xb.values.clone(), yb.values.clone());
                drop(xb);
                drop(yb);
                return elementwise_equal(&xs, &ys, depth + 1);
            }
        }

        (Value::Hash(x), Value::Hash(y)) => {
            let (xb, yb) = (x.borrow(), y.borrow());
            if xb.num_entries() != yb.num_entries() {
                false
            } else {
                let left_entries: Vec<_> = xb
                    .bins
                    .iter()
                    .flatten()
                    .map(|e| (e.key.clone(), e.record.clone()))
                    .collect();
                let right_entries: Vec<_> = yb
                    .bins
                    .iter()
                    .flatten()
                    .map(|e| (e.key.clone(), e.record.clone()))
                    .collect();
                drop(xb);
                drop(yb);
                return hash_entries_equal(&left_entries, &right_entries, depth + 1);
            }
        }

        // Everything else (functions, files, coroutines, foreign handles)
        // has no content-equality contract in the spec; compare by
        // identity of the backing heap object.
        (Value::Function(x), Value::Function(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::File(x), Value::File(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Coroutine(x), Value::Coroutine(y)) => std::rc::Rc::ptr_eq(x, y),
        (Value::Foreign(x), Value::Foreign(y)) => std::rc::Rc::ptr_eq(x, y),

        _ => false,
    })
}

fn elementwise_equal(left: &[Value], right: &[Value], depth: usize) -> Result<bool, RaiseError> {
    for (l, r) in left.iter().zip(right.iter()) {
        if !equal_at_depth(l, r, depth)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Entrywise hash equality: every key on the left must be present on the
/// right with an equal record. Not symmetric in implementation (only the
/// left side drives the lookup) but symmetric in result because both sides
/// were already checked to have the same entry count.
fn hash_entries_equal(
    left: &[(Value, Value)],
    right: &[(Value, Value)],
    depth: usize,
) -> Result<bool, RaiseError> {
    for (lk, lv) in left {
        let mut found = false;
        for (rk, rv) in right {
            if equal_at_depth(lk, rk, depth)? && equal_at_depth(lv, rv, depth)? {
                found = true;
                break;
            }
        }
        if !found {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lily_core::error::ExceptionClass;
    use lily_core::heap::{ContainerKind, ContainerObj, HashEntry, HashObj};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn double_compares_by_bits_not_partial_eq() {
        let nan_a = Value::Double(f64::NAN);
        let nan_b = Value::Double(f64::NAN);
        assert!(values_equal(&nan_a, &nan_b).unwrap());

        let pos_zero = Value::Double(0.0);
        let neg_zero = Value::Double(-0.0);
        assert!(!values_equal(&pos_zero, &neg_zero).unwrap());
    }

    #[test]
    fn variant_never_equals_tuple_of_same_shape() {
        let values = vec![Value::Integer(1), Value::Integer(2)];
        let tuple = Value::Tuple(Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::Tuple,
            7,
            values.clone(),
        ))));
        let variant = Value::Variant(Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::Variant,
            7,
            values,
        ))));
        assert!(!values_equal(&tuple, &variant).unwrap());
    }

    #[test]
    fn lists_compare_elementwise() {
        let a = Value::List(Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::List,
            0,
            vec![Value::Integer(1), Value::Integer(2)],
        ))));
        let b = Value::List(Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::List,
            0,
            vec![Value::Integer(1), Value::Integer(2)],
        ))));
        let c = Value::List(Rc::new(RefCell::new(ContainerObj::new(
            ContainerKind::List,
            0,
            vec![Value::Integer(1), Value::Integer(3)],
        ))));
        assert!(values_equal(&a, &b).unwrap());
        assert!(!values_equal(&a, &c).unwrap());
    }

    #[test]
    fn hashes_compare_entrywise_regardless_of_insertion_order() {
        let mut left = HashObj::new(4);
        left.bins[0].push(HashEntry {
            hash: 1,
            key: Value::Integer(1),
            record: Value::Integer(10),
        });
        left.bins[1].push(HashEntry {
            hash: 2,
            key: Value::Integer(2),
            record: Value::Integer(20),
        });

        let mut right = HashObj::new(4);
        right.bins[2].push(HashEntry {
            hash: 2,
            key: Value::Integer(2),
            record: Value::Integer(20),
        });
        right.bins[3].push(HashEntry {
            hash: 1,
            key: Value::Integer(1),
            record: Value::Integer(10),
        });

        let a = Value::Hash(Rc::new(RefCell::new(left)));
        let b = Value::Hash(Rc::new(RefCell::new(right)));
        assert!(values_equal(&a, &b).unwrap());
    }

    #[test]
    fn exceeding_depth_raises_runtime_error() {
        // A direct self-reference is enough to exhaust the depth budget
        // without needing a full cycle through two containers.
        let inner = Rc::new(RefCell::new(ContainerObj::new(ContainerKind::List, 0, vec![])));
        inner.borrow_mut().values.push(Value::List(Rc::clone(&inner)));
        let a = Value::List(Rc::clone(&inner));
        let b = Value::List(Rc::clone(&inner));

        let err = values_equal(&a, &b).unwrap_err();
        assert_eq!(err.class, ExceptionClass::RuntimeError);
        assert_eq!(err.message, "Infinite loop in comparison.");
    }
}
