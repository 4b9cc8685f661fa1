//! List growth, insert, and take (spec §3 "Lists grow... Growth policy: if
//! capacity is zero initialize to 8; otherwise double until the request
//! fits. Insert/take perform `memmove` of the trailing slice.").
//!
//! `ContainerObj` already stores `values: Vec<Value>` plus a separate
//! `extra_space` count so the doubling policy is observable independent of
//! `Vec`'s own (unspecified) growth factor — this module is the only place
//! that touches `extra_space`.

use lily_core::heap::ContainerObj;
use lily_core::value::Value;

/// Computes the new `num_values + extra_space` capacity for a request of
/// `needed` total slots, given the container's current capacity.
fn grown_capacity(current_capacity: usize, needed: usize) -> usize {
    if current_capacity == 0 {
        return needed.max(8);
    }
    let mut cap = current_capacity;
    while cap < needed {
        cap *= 2;
    }
    cap
}

/// `push`: appends one value, growing `extra_space` first if `values` is
/// already at capacity.
pub fn push(list: &mut ContainerObj, value: Value) {
    let capacity = list.values.len() + list.extra_space;
    let needed = list.values.len() + 1;
    if needed > capacity {
        let new_capacity = grown_capacity(capacity, needed);
        list.extra_space = new_capacity - list.values.len();
    }
    list.values.push(value);
    list.extra_space -= 1;
}

/// `insert(index, value)`: shifts everything at and after `index` right by
/// one (the "memmove of the trailing slice").
pub fn insert(list: &mut ContainerObj, index: usize, value: Value) {
    let capacity = list.values.len() + list.extra_space;
    let needed = list.values.len() + 1;
    if needed > capacity {
        let new_capacity = grown_capacity(capacity, needed);
        list.extra_space = new_capacity - list.values.len();
    }
    list.values.insert(index, value);
    list.extra_space -= 1;
}

/// `take(index)`: removes and returns the value at `index`, shifting the
/// trailing slice left by one; the freed slot becomes extra capacity rather
/// than being released.
pub fn take(list: &mut ContainerObj, index: usize) -> Value {
    let value = list.values.remove(index);
    list.extra_space += 1;
    value
}
