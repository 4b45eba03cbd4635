//! Error types for zql-core.
//!
//! All errors that can occur while building or running a query are
//! represented by [`ZqlError`]. Errors are propagated via `Result<T,
//! ZqlError>` at the boundaries that can fail for caller-correctable
//! reasons (query compilation, row ingestion). Contract and invariant
//! violations are programmer bugs and are never returned as `Result` —
//! see the `panics` module-level note below.
//!
//! # Error Classification
//!
//! - **Build** — unknown table/column/relationship, bad order direction,
//!   negative limit. Surfaced synchronously from `materialize()`/`run()`;
//!   the query is never constructed.
//! - **Schema violation** — a row pushed to a source is missing a column,
//!   has the wrong type, or has a null primary key. The push is rejected
//!   and nothing is mutated.
//! - **Storage** — the on-disk backing store for a source failed.
//!
//! Contract violations (`cleanup` without a prior `fetch`, joining an
//! operator to itself, unsorted bulk input to the ordered container) and
//! runtime invariant violations (duplicate primary key on `add`, `remove`
//! of a nonexistent row, an `edit` that reaches an operator while touching
//! a sort-order column) are **not** part of this enum: per the spec these
//! are fatal assertions, and the engine panics at the call site instead of
//! returning a `Result` a caller might be tempted to handle and continue
//! past.

use std::fmt;

/// Primary error type for query construction and row ingestion.
#[derive(Debug, thiserror::Error)]
pub enum ZqlError {
    // ── Build errors — fail synchronously, query not constructed ───────
    /// The query references a table that has no registered schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The query references a column not present in the table's schema.
    #[error("unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    /// `related`/`whereExists` names a relationship the schema doesn't declare.
    #[error("unknown relationship: {table}.{name}")]
    UnknownRelationship { table: String, name: String },

    /// `orderBy` was given a direction other than `asc`/`desc`.
    #[error("invalid order direction: {0}")]
    InvalidOrderDirection(String),

    /// `where` was given an operator outside spec §6's supported set.
    #[error("invalid comparison operator: {0}")]
    InvalidOperator(String),

    /// `limit` was negative.
    #[error("limit must be non-negative, got {0}")]
    NegativeLimit(i64),

    /// Two `related`/`whereExists`/`whereNotExists` clauses target the
    /// same relationship name. The builder can't merge two operator
    /// subtrees under one relationship key, so this rejects the build
    /// rather than silently picking one.
    #[error("relationship '{0}' specified more than once")]
    DuplicateRelated(String),

    // ── Schema violations — push rejected, nothing mutated ─────────────
    /// A pushed row is missing a required column.
    #[error("row for table '{table}' missing required column '{column}'")]
    MissingColumn { table: String, column: String },

    /// A pushed row's column has a value of the wrong kind.
    #[error("row for table '{table}' column '{column}' expected {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: &'static str,
    },

    /// A pushed row has `null`/`undefined` in a primary-key column.
    #[error("row for table '{table}' has null primary-key column '{column}'")]
    NullPrimaryKey { table: String, column: String },

    /// An `edit` change's `row` and `oldRow` disagree on primary key.
    #[error("edit for table '{table}' changes the primary key")]
    PrimaryKeyEditMismatch { table: String },

    // ── Storage I/O ──────────────────────────────────────────────────────
    /// The SQLite-backed storage layer reported an error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// `OrderedSet::from_sorted` was given input that was not strictly
    /// increasing under the supplied comparator.
    #[error("bulk input to ordered container was not strictly sorted")]
    UnsortedBulkInput,
}

/// Formats a contract/invariant violation message for use with `panic!`.
///
/// Centralizing the message shape (rather than inlining `panic!(...)` at
/// every call site) keeps panic text consistent and greppable, the way the
/// teacher centralizes its retryable-error text behind `PgTrickleError`'s
/// `Display` impl.
pub(crate) fn fatal(context: &str, detail: impl fmt::Display) -> ! {
    panic!("zql-core contract violation in {context}: {detail}")
}
