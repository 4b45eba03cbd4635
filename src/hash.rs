//! xxHash-based key hashing for composite operator keys.
//!
//! Join's primary-key-set bookkeeping and Take/Skip's partition bookkeeping
//! both need to compare composite `Value` tuples (a parent key value, a
//! partition key value) cheaply and often. Hashing the tuple to a 64-bit
//! fingerprint lets `Storage` keys and in-memory maps avoid re-serializing
//! the full tuple on every lookup. The hash is a fast-path de-duplication
//! aid only — every caller still falls back to the canonical `Value`
//! comparator to resolve collisions, so a hash collision can cost an extra
//! comparison but never corrupt a result.

use xxhash_rust::xxh64;

use crate::value::Value;

const SEED: u64 = 0x517cc1b727220a95;

/// Hashes a tuple of values into a single 64-bit fingerprint, combining
/// them with a `\x1E` record separator and a distinct marker for `Null`
/// so `(None, "a")` and `("a", None)`-shaped tuples never collide with
/// their rotations.
pub fn hash_values<'a, I>(values: I) -> u64
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut combined = String::new();
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            combined.push('\x1E');
        }
        match v {
            Value::Null => combined.push_str("\x00NULL\x00"),
            Value::Bool(b) => combined.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => combined.push_str(&n.to_string()),
            Value::String(s) => combined.push_str(s),
            Value::Json(j) => combined.push_str(&j.to_string()),
        }
    }
    xxh64::xxh64(combined.as_bytes(), SEED)
}

/// Hashes a single value; a thin wrapper over [`hash_values`] for the
/// common case of a scalar join/partition key.
pub fn hash_value(value: &Value) -> u64 {
    hash_values(std::iter::once(value))
}
