//! Condition trees: `column op value`, conjoined/disjoined.
//!
//! Every `Predicate` in this crate is, by construction, one of the "simple"
//! forms spec §4.2 describes as source-pushable (`column op value`, or
//! `and`/`or` trees of them) — there is no way to build a `Predicate` value
//! that expresses anything richer (a subquery, a cross-table comparison).
//! That means the builder never has to decide whether a `where` clause is
//! partially pushable: the whole tree always is, and `Source::connect`
//! always reports `fully_applied_filters = true` for whatever it is given.

use crate::error::ZqlError;
use crate::row::Row;
use crate::value::Value;

/// A comparison operator, per spec §6's supported `where` ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    ILike,
    NotILike,
    Is,
    IsNot,
}

impl CompareOp {
    pub fn parse(s: &str) -> Result<Self, ZqlError> {
        Ok(match s {
            "=" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "LIKE" => CompareOp::Like,
            "NOT LIKE" => CompareOp::NotLike,
            "ILIKE" => CompareOp::ILike,
            "NOT ILIKE" => CompareOp::NotILike,
            "IS" => CompareOp::Is,
            "IS NOT" => CompareOp::IsNot,
            other => return Err(ZqlError::InvalidOperator(other.to_string())),
        })
    }
}

/// A condition tree over a single table's columns.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Predicate::Compare {
            column: column.into(),
            op: CompareOp::Eq,
            value,
        }
    }

    /// Columns this predicate reads, for dependency tracking (e.g. "does
    /// an edit to this column need re-evaluating against the predicate").
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { column, .. } => out.push(column),
            Predicate::And(ps) | Predicate::Or(ps) => {
                for p in ps {
                    p.collect_columns(out);
                }
            }
        }
    }

    /// Evaluates the predicate against a row. Per spec §4.4: any binary
    /// comparison with a `null` operand is `false`, except `IS`/`IS NOT`;
    /// comparing values of unrelated kinds (e.g. a JSON value with `<`)
    /// also evaluates to `false` rather than panicking (spec §7).
    pub fn eval(&self, row: &Row) -> bool {
        match self {
            Predicate::Compare { column, op, value } => {
                let cell = row.get(column).cloned().unwrap_or(Value::Null);
                eval_compare(&cell, *op, value)
            }
            Predicate::And(ps) => ps.iter().all(|p| p.eval(row)),
            Predicate::Or(ps) => ps.iter().any(|p| p.eval(row)),
        }
    }
}

fn eval_compare(cell: &Value, op: CompareOp, rhs: &Value) -> bool {
    match op {
        CompareOp::Is => values_is(cell, rhs),
        CompareOp::IsNot => !values_is(cell, rhs),
        _ if cell.is_null() || rhs.is_null() => false,
        CompareOp::Eq => cell == rhs,
        CompareOp::Ne => cell != rhs,
        CompareOp::Lt => comparable_cmp(cell, rhs).is_some_and(|o| o.is_lt()),
        CompareOp::Le => comparable_cmp(cell, rhs).is_some_and(|o| o.is_le()),
        CompareOp::Gt => comparable_cmp(cell, rhs).is_some_and(|o| o.is_gt()),
        CompareOp::Ge => comparable_cmp(cell, rhs).is_some_and(|o| o.is_ge()),
        CompareOp::Like => cell.as_str().zip(rhs.as_str()).is_some_and(|(s, p)| like_match(s, p, false)),
        CompareOp::NotLike => cell.as_str().zip(rhs.as_str()).is_some_and(|(s, p)| !like_match(s, p, false)),
        CompareOp::ILike => cell.as_str().zip(rhs.as_str()).is_some_and(|(s, p)| like_match(s, p, true)),
        CompareOp::NotILike => cell.as_str().zip(rhs.as_str()).is_some_and(|(s, p)| !like_match(s, p, true)),
        CompareOp::Is | CompareOp::IsNot => unreachable!("handled above"),
    }
}

/// `IS`/`IS NOT` are the one comparison pair that legitimately operates on
/// `null` (`IS NULL`/`IS NOT NULL` is `IS`/`IS NOT` with a `Value::Null`
/// rhs); otherwise it is ordinary equality.
fn values_is(cell: &Value, rhs: &Value) -> bool {
    cell == rhs
}

/// Comparisons across mismatched `Value` kinds (e.g. JSON vs number) have
/// no meaningful `<`/`>`; per spec §7 these evaluate to `false`, modeled
/// here as `None` rather than falling back to kind-rank order (which
/// would silently produce a misleading answer for a predicate).
fn comparable_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    use Value::*;
    match (a, b) {
        (Number(_), Number(_)) | (String(_), String(_)) | (Bool(_), Bool(_)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// SQL `LIKE`/`ILIKE` wildcard matching: `%` matches any run (incl. empty),
/// `_` matches exactly one character, `\` escapes the following character.
pub fn like_match(input: &str, pattern: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| if case_insensitive { s.to_lowercase() } else { s.to_string() };
    let input: Vec<char> = fold(input).chars().collect();
    let pattern: Vec<char> = fold(pattern).chars().collect();
    like_match_chars(&input, &pattern)
}

fn like_match_chars(input: &[char], pattern: &[char]) -> bool {
    // Classic backtracking matcher; patterns here are short (column
    // literals), so quadratic worst case is not a concern.
    let mut memo = vec![vec![None; pattern.len() + 1]; input.len() + 1];
    like_rec(input, pattern, 0, 0, &mut memo)
}

fn like_rec(
    input: &[char],
    pattern: &[char],
    i: usize,
    p: usize,
    memo: &mut [Vec<Option<bool>>],
) -> bool {
    if let Some(cached) = memo[i][p] {
        return cached;
    }
    let result = if p == pattern.len() {
        i == input.len()
    } else {
        match pattern[p] {
            '%' => (i..=input.len()).any(|j| like_rec(input, pattern, j, p + 1, memo)),
            '_' => i < input.len() && like_rec(input, pattern, i + 1, p + 1, memo),
            '\\' if p + 1 < pattern.len() => {
                i < input.len()
                    && input[i] == pattern[p + 1]
                    && like_rec(input, pattern, i + 1, p + 2, memo)
            }
            c => i < input.len() && input[i] == c && like_rec(input, pattern, i + 1, p + 1, memo),
        }
    };
    memo[i][p] = Some(result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let m: BTreeMap<String, Value> = pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect();
        Row::new(m)
    }

    #[test]
    fn null_comparisons_are_false_except_is() {
        let r = row(&[("a", Value::Null)]);
        assert!(!Predicate::Compare { column: "a".into(), op: CompareOp::Eq, value: Value::Number(1.0) }.eval(&r));
        assert!(Predicate::Compare { column: "a".into(), op: CompareOp::Is, value: Value::Null }.eval(&r));
        assert!(!Predicate::Compare { column: "a".into(), op: CompareOp::IsNot, value: Value::Null }.eval(&r));
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("hello", "h%o", false));
        assert!(like_match("hello", "h_llo", false));
        assert!(!like_match("hello", "h_o", false));
        assert!(like_match("HELLO", "hello", true));
        assert!(!like_match("HELLO", "hello", false));
    }

    #[test]
    fn like_escaped_percent() {
        assert!(like_match("50%", "50\\%", false));
        assert!(!like_match("50x", "50\\%", false));
    }

    #[test]
    fn and_or_composition() {
        let r = row(&[("a", Value::Number(1.0)), ("b", Value::Number(2.0))]);
        let p = Predicate::And(vec![
            Predicate::eq("a", Value::Number(1.0)),
            Predicate::eq("b", Value::Number(2.0)),
        ]);
        assert!(p.eval(&r));
        let p2 = Predicate::Or(vec![
            Predicate::eq("a", Value::Number(9.0)),
            Predicate::eq("b", Value::Number(2.0)),
        ]);
        assert!(p2.eval(&r));
    }
}
