//! The [`Value`] type and its total order.
//!
//! `undefined` at the row level is treated identically to `null`: callers
//! normalize with [`normalize`] before a `Value` ever enters a [`Row`](crate::row::Row)
//! or a comparator.

use std::cmp::Ordering;

/// A single cell value. Kinds compare `null < boolean < number < string <
/// json`, stably; within a kind, by natural order. Numbers are assumed
/// finite (the spec scopes NaN/Infinity out) and are compared with
/// `f64::total_cmp` so `Value` can implement a total `Ord`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
}

impl Value {
    /// Ranks this value's kind for the null < bool < number < string < json order.
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Json(_) => 4,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            // strings compare by UTF-8 code-point order, which is exactly
            // what `str`'s byte-wise `Ord` gives for valid UTF-8.
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => compare_json(a, b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

/// JSON values have no natural total order; we define a stable one so
/// `Value::Json` can still sit inside an [`crate::ordered_set::OrderedSet`].
/// Comparison is by kind (using serde_json's own variant order) and then
/// structurally. This is only reachable when two rows legitimately carry
/// JSON in a sort-order column, which is rare and not load-bearing for
/// correctness beyond "some stable total order."
fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value as J;
    fn rank(v: &J) -> u8 {
        match v {
            J::Null => 0,
            J::Bool(_) => 1,
            J::Number(_) => 2,
            J::String(_) => 3,
            J::Array(_) => 4,
            J::Object(_) => 5,
        }
    }
    match (a, b) {
        (J::Null, J::Null) => Ordering::Equal,
        (J::Bool(x), J::Bool(y)) => x.cmp(y),
        (J::Number(x), J::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        (J::String(x), J::String(y)) => x.cmp(y),
        (J::Array(x), J::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let c = compare_json(xi, yi);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        (J::Object(x), J::Object(y)) => {
            let mut xk: Vec<_> = x.iter().collect();
            let mut yk: Vec<_> = y.iter().collect();
            xk.sort_by(|a, b| a.0.cmp(b.0));
            yk.sort_by(|a, b| a.0.cmp(b.0));
            for ((xk_, xv), (yk_, yv)) in xk.iter().zip(yk.iter()) {
                let c = xk_.cmp(yk_);
                if c != Ordering::Equal {
                    return c;
                }
                let c = compare_json(xv, yv);
                if c != Ordering::Equal {
                    return c;
                }
            }
            xk.len().cmp(&yk.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Normalizes a value on the way into a row or comparator: `undefined`
/// (represented here by `Option::None`) collapses to `Value::Null`.
pub fn normalize(v: Option<Value>) -> Value {
    v.unwrap_or(Value::Null)
}
