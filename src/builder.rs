//! The Builder (spec §4.10 / component C7): compiles a declarative AST
//! into a wired operator graph, bottom-up, against a table registry.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::rc::{Rc, Weak};

use crate::error::ZqlError;
use crate::operator::exists::ExistsOperator;
use crate::operator::join::JoinOperator;
use crate::operator::take::TakeOperator;
use crate::operator::{Basis, Change, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema, StartBound};
use crate::predicate::Predicate;
use crate::query::Engine;
use crate::row::{Direction, Ordering, Row, RowComparator};

/// Which flavor of relationship clause a `RelatedAst` entry describes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RelatedKind {
    /// `related(name, sub)`: attach `sub`'s results under `name`.
    Normal,
    /// `whereExists(name, sub?)`: keep only parents with ≥1 matching child.
    Exists,
    /// `whereNotExists(name, sub?)`: keep only parents with 0 matching children.
    NotExists,
}

/// One `related`/`whereExists`/`whereNotExists` clause.
#[derive(Clone)]
pub struct RelatedAst {
    pub name: String,
    pub kind: RelatedKind,
    pub sub: QueryAst,
}

/// A pagination cursor, per spec §6 `start`.
#[derive(Clone)]
pub struct StartAst {
    pub row: Row,
    pub basis: Basis,
}

/// The declarative query AST the Builder compiles, per spec §4.10:
/// `{table, where?, related?, orderBy, limit?, start?}`.
#[derive(Clone, Default)]
pub struct QueryAst {
    pub table: String,
    pub filter: Option<Predicate>,
    pub related: Vec<RelatedAst>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<i64>,
    pub start: Option<StartAst>,
}

/// Gates `fetch`/`cleanup`/`push` at a root `start` cursor: initial
/// hydration windows from the anchor (forwarded into the upstream
/// `Source` connection's own `start`-aware windowing), and every
/// subsequent push is dropped unless its row would sort on the admitted
/// side of the anchor under the root ordering.
///
/// This is the engine's reading of spec §4.10 step 4 ("install a Skip or
/// asymmetric Take depending on the anchor kind"): rather than a second,
/// distinct operator shape per anchor kind, one gate handles both `at`
/// and `after` uniformly via the comparator, recorded in DESIGN.md.
struct CursorOperator {
    input: Rc<dyn PipelineInput>,
    anchor: StartBound,
    comparator: RowComparator,
    schema: Schema,
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl CursorOperator {
    fn new(input: Rc<dyn PipelineInput>, anchor: StartBound) -> Rc<Self> {
        let schema = input.schema().clone();
        let comparator = schema.comparator.clone();
        let cursor = Rc::new(CursorOperator { input: input.clone(), anchor, comparator, schema, output: RefCell::new(None) });
        input.attach_output(cursor.clone());
        cursor
    }

    fn admits(&self, row: &Row) -> bool {
        let ord = self.comparator.compare(row, &self.anchor.row);
        match self.anchor.basis {
            Basis::At => ord != CmpOrdering::Less,
            Basis::After => ord == CmpOrdering::Greater,
        }
    }

    fn emit(&self, change: Change) {
        if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
            out.push(change, InputSide::Primary);
        }
    }
}

impl Input for CursorOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        if req.start.is_some() {
            return self.input.fetch(req);
        }
        let merged = Req { constraint: req.constraint.clone(), start: Some(self.anchor.clone()), reverse: req.reverse, limit: req.limit };
        self.input.fetch(&merged)
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        if req.start.is_some() {
            return self.input.cleanup(req);
        }
        let merged = Req { constraint: req.constraint.clone(), start: Some(self.anchor.clone()), reverse: req.reverse, limit: req.limit };
        self.input.cleanup(&merged)
    }
}

impl Output for CursorOperator {
    fn push(&self, change: Change, _from: InputSide) {
        let admitted = match &change {
            Change::Add(n) | Change::Remove(n) => self.admits(&n.row),
            Change::Edit { old_row, .. } => self.admits(old_row),
            Change::Child { row, .. } => self.admits(row),
        };
        if admitted {
            self.emit(change);
        }
    }
}

impl Operator for CursorOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for CursorOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}

/// Wires one query AST (and recursively, every `related` subquery) into a
/// pipeline. Returns the final stage; the caller attaches a `View`.
pub fn build(engine: &Engine, ast: &QueryAst) -> Result<Rc<dyn PipelineInput>, ZqlError> {
    let source = engine.source(&ast.table)?;

    for col in ast.order_by.iter().map(|(c, _)| c.as_str()).chain(ast.filter.iter().flat_map(|p| p.columns())) {
        if !source.schema.columns.contains_key(col) && !source.schema.primary_key.iter().any(|pk| pk == col) {
            return Err(ZqlError::UnknownColumn { table: ast.table.clone(), column: col.to_string() });
        }
    }
    if let Some(limit) = ast.limit {
        if limit < 0 {
            return Err(ZqlError::NegativeLimit(limit));
        }
    }

    let ordering = if ast.order_by.is_empty() {
        Ordering::new(source.schema.primary_key.iter().map(|c| (c.clone(), Direction::Asc)).collect())
    } else {
        Ordering::new(ast.order_by.clone()).extended_with_primary_key(&source.schema.primary_key)
    };
    let connection = source.connect(ordering, ast.filter.clone());
    // `Predicate` only ever expresses the source-pushable shape (see
    // predicate.rs), so `fully_applied_filters` is always true and there
    // is never a residual clause to wire as a downstream `Filter` here.
    debug_assert!(connection.fully_applied_filters);
    let mut pipeline: Rc<dyn PipelineInput> = Rc::new(connection);

    let mut seen_names: Vec<&str> = Vec::new();
    for related in &ast.related {
        if seen_names.contains(&related.name.as_str()) {
            return Err(ZqlError::DuplicateRelated(related.name.clone()));
        }
        seen_names.push(&related.name);

        let child_rel = source
            .schema
            .relationships
            .get(&related.name)
            .ok_or_else(|| ZqlError::UnknownRelationship { table: ast.table.clone(), name: related.name.clone() })?
            .clone();

        let child_pipeline = build(engine, &related.sub)?;
        let joined = JoinOperator::new(pipeline, child_pipeline, child_rel.parent_key.clone(), child_rel.child_key.clone(), related.name.clone());

        pipeline = match related.kind {
            RelatedKind::Normal => joined,
            RelatedKind::Exists => ExistsOperator::new(joined, related.name.clone(), false),
            RelatedKind::NotExists => ExistsOperator::new(joined, related.name.clone(), true),
        };
    }

    if let Some(start) = &ast.start {
        let anchor = StartBound { row: start.row.clone(), basis: start.basis };
        pipeline = CursorOperator::new(pipeline, anchor);
    }

    if let Some(limit) = ast.limit {
        pipeline = TakeOperator::new(pipeline, limit as usize, None);
    }

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::row::{ColumnSchema, ColumnType, RelationshipSchema, TableSchema};
    use crate::source::SourceChange;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn issue_schema() -> TableSchema {
        let mut cols = BTreeMap::new();
        cols.insert("id".to_string(), ColumnSchema { ty: ColumnType::Number, optional: false });
        cols.insert("open".to_string(), ColumnSchema { ty: ColumnType::Boolean, optional: false });
        TableSchema::new("issue", cols, vec!["id".to_string()]).with_relationship(
            "comments",
            RelationshipSchema { child_table: "comment".to_string(), parent_key: "id".to_string(), child_key: "issue_id".to_string() },
        )
    }

    fn comment_schema() -> TableSchema {
        let mut cols = BTreeMap::new();
        cols.insert("id".to_string(), ColumnSchema { ty: ColumnType::Number, optional: false });
        cols.insert("issue_id".to_string(), ColumnSchema { ty: ColumnType::Number, optional: false });
        TableSchema::new("comment", cols, vec!["id".to_string()])
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        Row::from_pairs(pairs.iter().cloned().map(|(k, v)| (k.to_string(), Some(v))))
    }

    #[test]
    fn unknown_column_in_filter_is_a_build_error() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        let ast = QueryAst {
            table: "issue".to_string(),
            filter: Some(Predicate::eq("nope", Value::Bool(true))),
            order_by: vec![("id".to_string(), Direction::Asc)],
            ..Default::default()
        };
        assert!(matches!(build(&engine, &ast), Err(ZqlError::UnknownColumn { .. })));
    }

    #[test]
    fn filter_pushdown_end_to_end() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        let source = engine.source("issue").unwrap();
        source.push(SourceChange::Add(row(&[("id", Value::Number(1.0)), ("open", Value::Bool(true))]))).unwrap();
        source.push(SourceChange::Add(row(&[("id", Value::Number(2.0)), ("open", Value::Bool(false))]))).unwrap();
        source.push(SourceChange::Add(row(&[("id", Value::Number(3.0)), ("open", Value::Bool(true))]))).unwrap();

        let ast = QueryAst {
            table: "issue".to_string(),
            filter: Some(Predicate::eq("open", Value::Bool(true))),
            order_by: vec![("id".to_string(), Direction::Asc)],
            ..Default::default()
        };
        let pipeline = build(&engine, &ast).unwrap();
        let nodes = pipeline.fetch(&Req::none());
        let ids: Vec<f64> = nodes.iter().map(|n| n.row.get("id").unwrap().as_number().unwrap()).collect();
        assert_eq!(ids, vec![1.0, 3.0]);
    }

    #[test]
    fn related_join_and_limit() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        engine.register_table(comment_schema()).unwrap();
        let issues = engine.source("issue").unwrap();
        let comments = engine.source("comment").unwrap();
        issues.push(SourceChange::Add(row(&[("id", Value::Number(1.0)), ("open", Value::Bool(true))]))).unwrap();
        issues.push(SourceChange::Add(row(&[("id", Value::Number(2.0)), ("open", Value::Bool(true))]))).unwrap();
        comments.push(SourceChange::Add(row(&[("id", Value::Number(10.0)), ("issue_id", Value::Number(1.0))]))).unwrap();
        comments.push(SourceChange::Add(row(&[("id", Value::Number(11.0)), ("issue_id", Value::Number(1.0))]))).unwrap();

        let ast = QueryAst {
            table: "issue".to_string(),
            order_by: vec![("id".to_string(), Direction::Asc)],
            related: vec![RelatedAst {
                name: "comments".to_string(),
                kind: RelatedKind::Normal,
                sub: QueryAst {
                    table: "comment".to_string(),
                    order_by: vec![("id".to_string(), Direction::Asc)],
                    ..Default::default()
                },
            }],
            limit: Some(1),
            ..Default::default()
        };
        let pipeline = build(&engine, &ast).unwrap();
        let nodes = pipeline.fetch(&Req::none());
        assert_eq!(nodes.len(), 1);
        let children = nodes[0].relationships["comments"]();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn dropping_a_joined_limited_query_releases_both_sources() {
        let mut engine = Engine::new(Config::default());
        engine.register_table(issue_schema()).unwrap();
        engine.register_table(comment_schema()).unwrap();
        let issues = engine.source("issue").unwrap();
        let comments = engine.source("comment").unwrap();
        issues.push(SourceChange::Add(row(&[("id", Value::Number(1.0)), ("open", Value::Bool(true))]))).unwrap();
        comments.push(SourceChange::Add(row(&[("id", Value::Number(10.0)), ("issue_id", Value::Number(1.0))]))).unwrap();

        let ast = QueryAst {
            table: "issue".to_string(),
            order_by: vec![("id".to_string(), Direction::Asc)],
            related: vec![RelatedAst {
                name: "comments".to_string(),
                kind: RelatedKind::Normal,
                sub: QueryAst {
                    table: "comment".to_string(),
                    order_by: vec![("id".to_string(), Direction::Asc)],
                    ..Default::default()
                },
            }],
            limit: Some(5),
            ..Default::default()
        };
        let pipeline = build(&engine, &ast).unwrap();
        assert_eq!(issues.connection_count(), 1);
        assert_eq!(comments.connection_count(), 1);

        drop(pipeline);
        assert_eq!(issues.connection_count(), 0, "Join/Take wiring must not keep the parent Source connection alive");
        assert_eq!(comments.connection_count(), 0, "Join/Take wiring must not keep the child Source connection alive");
    }
}
