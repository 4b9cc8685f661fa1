//! The `Hash` container (spec §3: "open-addressed-by-chaining with
//! siphash2-4 (key from interpreter config)... Keys must be `String`,
//! `Integer`, or `ByteString`; equality is by content."), plus spec §4.9's
//! "iteration order is bin-major then chain order; callers must not rely on
//! stability across mutations."

use lily_core::error::RaiseError;
use lily_core::heap::{HashEntry, HashObj};
use lily_core::siphash::{hash_key, SipKey};
use lily_core::value::Value;

/// Extracts the siphash key kind from a `Value`, rejecting anything that
/// isn't `String`/`Integer`/`ByteString` (spec's key-type restriction).
pub fn key_of(value: &Value) -> Result<SipKey, RaiseError> {
    match value {
        Value::Integer(i) => Ok(SipKey::Integer(*i)),
        Value::String(s) => Ok(SipKey::String(s.borrow().data.clone())),
        Value::ByteString(b) => Ok(SipKey::ByteString(b.borrow().data.clone())),
        other => Err(RaiseError::runtime(format!(
            "Hash key must be String, Integer, or ByteString (got {:?}).",
            other.base()
        ))),
    }
}

fn bin_of(hash: u64, num_bins: usize) -> usize {
    (hash as usize) % num_bins
}

/// `hash_get`: looks up `key` by content equality within its bin's chain.
pub fn get(
    table: &HashObj,
    key: &Value,
    sipkey: &[u8; 16],
) -> Result<Option<Value>, RaiseError> {
    let hk = key_of(key)?;
    let h = hash_key(&hk, sipkey);
    let bin = bin_of(h, table.num_bins);
    for entry in &table.bins[bin] {
        if entry.hash == h && crate::value_ops::values_equal(&entry.key, key)? {
            return Ok(Some(entry.record.clone()));
        }
    }
    Ok(None)
}

/// `hash_set`: inserts or overwrites the record for `key`'s chain entry.
pub fn set(
    table: &mut HashObj,
    key: Value,
    record: Value,
    sipkey: &[u8; 16],
) -> Result<(), RaiseError> {
    let hk = key_of(&key)?;
    let h = hash_key(&hk, sipkey);
    let bin = bin_of(h, table.num_bins);
    for entry in &mut table.bins[bin] {
        if entry.hash == h && crate::value_ops::values_equal(&entry.key, &key)? {
            entry.record = record;
            return Ok(());
        }
    }
    table.bins[bin].push(HashEntry {
        hash: h,
        key,
        record,
    });
    Ok(())
}

/// `hash_remove`: errors if an iteration is in progress (spec §5: "removal
/// must raise rather than invalidate the iterator").
pub fn remove(
    table: &mut HashObj,
    key: &Value,
    sipkey: &[u8; 16],
) -> Result<bool, RaiseError> {
    if table.iter_count > 0 {
        return Err(RaiseError::runtime(
            "Cannot remove key from hash during iteration.",
        ));
    }
    let hk = key_of(key)?;
    let h = hash_key(&hk, sipkey);
    let bin = bin_of(h, table.num_bins);
    let before = table.bins[bin].len();
    let mut removed = false;
    let mut kept = Vec::with_capacity(before);
    for entry in table.bins[bin].drain(..) {
        if !removed && entry.hash == h && crate::value_ops::values_equal(&entry.key, key)? {
            removed = true;
            continue;
        }
        kept.push(entry);
    }
    table.bins[bin] = kept;
    Ok(removed)
}

/// Bin-major, then chain-order: the only order the spec promises, and
/// explicitly not stable across mutation.
pub fn iter_pairs(table: &HashObj) -> impl Iterator<Item = (&Value, &Value)> {
    table
        .bins
        .iter()
        .flat_map(|bin| bin.iter())
        .map(|entry| (&entry.key, &entry.record))
}
