//! zql-core: an incremental view maintenance dataflow engine.
//!
//! Rows enter through a table's [`source::Source`], flow through a graph
//! of [`operator`]s built by [`builder`], and settle in a [`view::View`]
//! that callers observe through [`query::QueryHandle`]. [`query::Engine`]
//! is the entry point: register tables, then build queries with
//! [`query::Query`].

pub mod builder;
pub mod config;
pub mod error;
pub mod hash;
pub mod operator;
pub mod ordered_set;
pub mod predicate;
pub mod query;
pub mod row;
pub mod source;
pub mod storage;
pub mod value;
pub mod view;

pub use builder::{QueryAst, RelatedAst, RelatedKind, StartAst};
pub use config::{Config, StorageKind};
pub use error::ZqlError;
pub use operator::{Basis, Change, InputSide};
pub use predicate::{CompareOp, Predicate};
pub use query::{Engine, Query, QueryHandle};
pub use row::{ColumnSchema, ColumnType, Direction, Ordering, RelationshipSchema, Row, TableSchema};
pub use source::{Source, SourceChange};
pub use value::Value;
pub use view::MaterializedNode;
