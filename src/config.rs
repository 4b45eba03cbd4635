//! Engine-wide tunables, separate from any single query's AST.

/// Where a newly registered table's rows live.
#[derive(Debug, Clone)]
pub enum StorageKind {
    Memory,
    Sqlite { path: String },
}

/// Constructor parameters for an [`crate::query::Engine`]. Plain data
/// rather than global mutable statics — there is no long-lived backend
/// process here to own a GUC-style table.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing store newly registered tables get when they don't name
    /// their own explicit storage.
    pub default_row_storage: StorageKind,
    /// `Source::push` logs a `tracing::warn!` when a single batch exceeds
    /// this many changes. Purely an operational signal: nothing is
    /// rejected or truncated.
    pub max_push_batch_warn: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_row_storage: StorageKind::Memory,
            max_push_batch_warn: 10_000,
        }
    }
}
