//! The external interface (spec §6): [`Engine`] owns the table registry,
//! [`Query`] is the fluent builder every caller assembles a query through,
//! and [`QueryHandle`] is the live, listener-bearing materialized result.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::builder::{self, QueryAst, RelatedAst, RelatedKind, StartAst};
use crate::config::{Config, StorageKind};
use crate::error::ZqlError;
use crate::operator::Basis;
use crate::predicate::Predicate;
use crate::row::{Direction, Row, TableSchema};
use crate::source::{RowStorage, Source, SourceChange};
use crate::storage::SqliteStorage;
use crate::view::{MaterializedNode, View};

/// Owns every registered table's [`Source`] plus the engine-wide
/// [`Config`]. Tables are looked up by name when a [`Query`] is built or a
/// change is pushed.
pub struct Engine {
    tables: BTreeMap<String, Rc<Source>>,
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Engine { tables: BTreeMap::new(), config }
    }

    /// Registers a table's schema, allocating its [`Source`] with the
    /// engine's default row storage. Re-registering an existing table name
    /// replaces it (and drops whatever rows/connections it held).
    pub fn register_table(&mut self, schema: TableSchema) -> Result<Rc<Source>, ZqlError> {
        let storage = match &self.config.default_row_storage {
            StorageKind::Memory => RowStorage::Memory,
            StorageKind::Sqlite { path } => RowStorage::Sqlite(RefCell::new(SqliteStorage::open(path)?)),
        };
        let name = schema.name.clone();
        let source = Source::with_storage(schema, storage);
        self.tables.insert(name, source.clone());
        Ok(source)
    }

    pub fn source(&self, name: &str) -> Result<Rc<Source>, ZqlError> {
        self.tables.get(name).cloned().ok_or_else(|| ZqlError::UnknownTable(name.to_string()))
    }

    /// Applies one change to a registered table (spec §6 change ingestion).
    pub fn push(&self, table: &str, change: SourceChange) -> Result<(), ZqlError> {
        self.source(table)?.push(change)
    }

    /// Applies a batch of changes in order, warning (not rejecting) if the
    /// batch exceeds `Config::max_push_batch_warn`.
    pub fn push_batch(&self, table: &str, changes: Vec<SourceChange>) -> Result<(), ZqlError> {
        if changes.len() > self.config.max_push_batch_warn {
            tracing::warn!(table, batch_size = changes.len(), "push batch exceeds configured warn threshold");
        }
        let source = self.source(table)?;
        for change in changes {
            source.push(change)?;
        }
        Ok(())
    }

    pub fn query(&self, table: impl Into<String>) -> Query<'_> {
        Query::from(self, table)
    }
}

/// A fluent query builder; terminal methods are [`Query::materialize`] (a
/// live, listenable [`QueryHandle`]) and [`Query::run`] (a one-shot
/// hydrate-then-snapshot that immediately tears the pipeline back down).
pub struct Query<'a> {
    engine: &'a Engine,
    ast: QueryAst,
}

impl<'a> Query<'a> {
    pub fn from(engine: &'a Engine, table: impl Into<String>) -> Self {
        Query { engine, ast: QueryAst { table: table.into(), ..Default::default() } }
    }

    pub fn where_predicate(mut self, predicate: Predicate) -> Self {
        self.ast.filter = Some(match self.ast.filter {
            Some(existing) => Predicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn related(mut self, name: impl Into<String>, sub: QueryAst) -> Self {
        self.ast.related.push(RelatedAst { name: name.into(), kind: RelatedKind::Normal, sub });
        self
    }

    pub fn where_exists(mut self, name: impl Into<String>, sub: QueryAst) -> Self {
        self.ast.related.push(RelatedAst { name: name.into(), kind: RelatedKind::Exists, sub });
        self
    }

    pub fn where_not_exists(mut self, name: impl Into<String>, sub: QueryAst) -> Self {
        self.ast.related.push(RelatedAst { name: name.into(), kind: RelatedKind::NotExists, sub });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.ast.order_by.push((column.into(), direction));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.ast.limit = Some(limit);
        self
    }

    pub fn start(mut self, row: Row, basis: Basis) -> Self {
        self.ast.start = Some(StartAst { row, basis });
        self
    }

    /// Compiles and wires the pipeline, hydrates it, and returns a live
    /// handle that keeps receiving incremental updates until dropped.
    pub fn materialize(self) -> Result<QueryHandle, ZqlError> {
        let pipeline = builder::build(self.engine, &self.ast)?;
        let view = View::new(pipeline);
        view.hydrate();
        Ok(QueryHandle { view })
    }

    /// Hydrates the query, takes one snapshot, then tears the pipeline
    /// down immediately — for callers that don't want live updates.
    pub fn run(self) -> Result<Vec<MaterializedNode>, ZqlError> {
        let handle = self.materialize()?;
        Ok(handle.snapshot())
    }
}

/// A live, listener-bearing materialized query result (spec §6
/// `materialize()`). Dropping the handle tears down its pipeline: every
/// operator and `SourceConnection` it holds releases its `Storage` and
/// index claims via `Drop`.
pub struct QueryHandle {
    view: Rc<View>,
}

impl QueryHandle {
    pub fn snapshot(&self) -> Vec<MaterializedNode> {
        self.view.current()
    }

    pub fn add_listener(&self, listener: Box<dyn Fn(&[MaterializedNode])>) -> u64 {
        self.view.add_listener(listener)
    }

    pub fn remove_listener(&self, id: u64) {
        self.view.remove_listener(id)
    }

    /// Consumes the handle, dropping its pipeline. Equivalent to simply
    /// dropping the handle; spelled out for callers that want the teardown
    /// to read as an explicit step.
    pub fn destroy(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{ColumnSchema, ColumnType};
    use crate::value::Value;

    fn issue_schema() -> TableSchema {
        let mut cols = BTreeMap::new();
        cols.insert("id".to_string(), ColumnSchema { ty: ColumnType::Number, optional: false });
        cols.insert("open".to_string(), ColumnSchema { ty: ColumnType::Boolean, optional: false });
        TableSchema::new("issue", cols, vec!["id".to_string()])
    }

    fn row(id: f64, open: bool) -> Row {
        Row::from_pairs([
            ("id".to_string(), Some(Value::Number(id))),
            ("open".to_string(), Some(Value::Bool(open))),
        ])
    }

    #[test]
    fn unregistered_table_is_a_build_error() {
        let engine = Engine::new(Config::default());
        let result = engine.query("nope").order_by("id", Direction::Asc).run();
        assert!(matches!(result, Err(ZqlError::UnknownTable(_))));
    }

    #[test]
    fn run_hydrates_and_tears_down() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        let source = engine.source("issue").unwrap();
        source.push(SourceChange::Add(row(1.0, true))).unwrap();
        source.push(SourceChange::Add(row(2.0, false))).unwrap();

        let rows = engine
            .query("issue")
            .where_predicate(Predicate::eq("open", Value::Bool(true)))
            .order_by("id", Direction::Asc)
            .run()
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn materialize_receives_incremental_pushes() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        let source = engine.source("issue").unwrap();
        source.push(SourceChange::Add(row(1.0, true))).unwrap();

        let handle = engine.query("issue").order_by("id", Direction::Asc).materialize().unwrap();
        assert_eq!(handle.snapshot().len(), 1);

        source.push(SourceChange::Add(row(2.0, true))).unwrap();
        assert_eq!(handle.snapshot().len(), 2);
    }
}
