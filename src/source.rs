//! Source (component C3): the authoritative in-process row container for
//! one table, its secondary indices, and its connections.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::error::ZqlError;
use crate::ordered_set::OrderedSet;
use crate::predicate::Predicate;
use crate::row::{Direction, Ordering, Row, RowComparator, TableSchema};
use crate::operator::{Change, Input, InputSide, Node, Output, PipelineInput, Req, Schema};
use crate::storage::{SqliteStorage, Storage, StorageKey};
use crate::value::Value;

/// A pending mutation at the Source boundary (spec §6 "change ingestion").
#[derive(Clone)]
pub enum SourceChange {
    Add(Row),
    Remove(Row),
    Edit { row: Row, old_row: Row },
}

type OrderKey = Vec<(String, Direction)>;

struct Index {
    set: OrderedSet<Row>,
    ordering: Ordering,
    comparator: RowComparator,
    refcount: usize,
}

struct ConnEntry {
    order_key: OrderKey,
    predicate: Option<Predicate>,
    output: RefCell<Option<Weak<dyn Output>>>,
}

/// Where a Source persists its canonical rows. Operator scratch storage
/// (§4.3) is always `MemStorage`; only a Source's own row data may be
/// SQLite-backed (SPEC_FULL.md §4.2a).
pub enum RowStorage {
    Memory,
    Sqlite(RefCell<SqliteStorage>),
}

/// Owns a table's canonical rows plus one `OrderedSet` index per distinct
/// requested `Ordering`. Always carries a permanent primary-key index
/// (spec §3: "the primary-key index is permanent").
pub struct Source {
    pub schema: TableSchema,
    rows: RefCell<BTreeMap<Vec<Value>, Row>>,
    indices: RefCell<BTreeMap<OrderKey, Index>>,
    connections: RefCell<Vec<Rc<ConnEntry>>>,
    pk_order_key: OrderKey,
    storage: RowStorage,
}

impl Source {
    pub fn new(schema: TableSchema) -> Rc<Self> {
        Self::with_storage(schema, RowStorage::Memory)
    }

    pub fn with_storage(schema: TableSchema, storage: RowStorage) -> Rc<Self> {
        let pk_ordering = Ordering::new(
            schema
                .primary_key
                .iter()
                .map(|c| (c.clone(), Direction::Asc))
                .collect(),
        );
        let pk_order_key = pk_ordering.components().to_vec();
        let comparator = pk_ordering.comparator();
        let mut indices = BTreeMap::new();
        indices.insert(
            pk_order_key.clone(),
            Index {
                set: OrderedSet::new(std::sync::Arc::new(move |a: &Row, b: &Row| comparator.compare(a, b))),
                ordering: pk_ordering.clone(),
                comparator: pk_ordering.comparator(),
                refcount: 1, // permanent
            },
        );
        Rc::new(Source {
            schema,
            rows: RefCell::new(BTreeMap::new()),
            indices: RefCell::new(indices),
            connections: RefCell::new(Vec::new()),
            pk_order_key,
            storage,
        })
    }

    /// Number of currently-open connections, for teardown tests.
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    fn primary_key_tuple(&self, row: &Row) -> Vec<Value> {
        self.schema.primary_key_of(row).into_iter().cloned().collect()
    }

    /// Finds or creates the index for `ordering`, bumping its refcount.
    fn acquire_index(&self, ordering: &Ordering) -> OrderKey {
        let key = ordering.components().to_vec();
        let mut indices = self.indices.borrow_mut();
        if let Some(idx) = indices.get_mut(&key) {
            idx.refcount += 1;
            return key;
        }
        let comparator = ordering.comparator();
        let cmp_for_set = comparator.clone();
        let mut set = OrderedSet::new(std::sync::Arc::new(move |a: &Row, b: &Row| cmp_for_set.compare(a, b)));
        for row in self.rows.borrow().values() {
            set.add(row.clone());
        }
        indices.insert(
            key.clone(),
            Index {
                set,
                ordering: ordering.clone(),
                comparator,
                refcount: 1,
            },
        );
        key
    }

    fn release_index(&self, key: &OrderKey) {
        if *key == self.pk_order_key {
            return; // permanent
        }
        let mut indices = self.indices.borrow_mut();
        let drop_it = if let Some(idx) = indices.get_mut(key) {
            idx.refcount -= 1;
            idx.refcount == 0
        } else {
            false
        };
        if drop_it {
            indices.remove(key);
        }
    }

    /// Opens a connection in the given ordering with an optional pushed
    /// predicate (spec §4.2 `connect`). The returned `fully_applied_filters`
    /// is always `true`: this engine only ever constructs `Predicate`
    /// trees of the "simple" shape spec §4.2 describes as pushable, so
    /// whatever is handed to a Source it can fully apply itself.
    pub fn connect(self: &Rc<Self>, ordering: Ordering, predicate: Option<Predicate>) -> SourceConnection {
        let order_key = self.acquire_index(&ordering);
        let comparator = ordering.comparator();
        let entry = Rc::new(ConnEntry {
            order_key: order_key.clone(),
            predicate: predicate.clone(),
            output: RefCell::new(None),
        });
        self.connections.borrow_mut().push(entry.clone());
        let schema = Schema::leaf(self.schema.name.clone(), self.schema.primary_key.clone(), comparator.clone());
        SourceConnection {
            source: self.clone(),
            entry,
            order_key,
            comparator,
            schema,
            fully_applied_filters: true,
        }
    }

    /// Applies one change to every index and canonical row store, then
    /// fans it out to every live connection (spec §4.2 `push`).
    pub fn push(&self, change: SourceChange) -> Result<(), ZqlError> {
        match change {
            SourceChange::Add(row) => self.push_add(row),
            SourceChange::Remove(row) => self.push_remove(row),
            SourceChange::Edit { row, old_row } => self.push_edit(row, old_row),
        }
    }

    fn push_add(&self, row: Row) -> Result<(), ZqlError> {
        self.schema.validate(&row)?;
        let pk = self.primary_key_tuple(&row);
        {
            let mut rows = self.rows.borrow_mut();
            if rows.contains_key(&pk) {
                crate::error::fatal("Source::push(add)", format!("duplicate primary key in table '{}'", self.schema.name));
            }
            rows.insert(pk, row.clone());
        }
        self.persist_add(&row)?;
        for idx in self.indices.borrow_mut().values_mut() {
            idx.set.add(row.clone());
        }
        for conn in self.connections.borrow().iter() {
            if conn.predicate.as_ref().is_none_or(|p| p.eval(&row)) {
                Self::emit(conn, Change::Add(Node::leaf(row.clone())));
            }
        }
        Ok(())
    }

    fn push_remove(&self, row: Row) -> Result<(), ZqlError> {
        let pk = self.primary_key_tuple(&row);
        let old_row = {
            let mut rows = self.rows.borrow_mut();
            match rows.remove(&pk) {
                Some(r) => r,
                None => crate::error::fatal(
                    "Source::push(remove)",
                    format!("row not present in table '{}'", self.schema.name),
                ),
            }
        };
        self.persist_remove(&old_row)?;
        for idx in self.indices.borrow_mut().values_mut() {
            idx.set.delete(&old_row);
        }
        for conn in self.connections.borrow().iter() {
            if conn.predicate.as_ref().is_none_or(|p| p.eval(&old_row)) {
                Self::emit(conn, Change::Remove(Node::leaf(old_row.clone())));
            }
        }
        Ok(())
    }

    fn push_edit(&self, row: Row, old_row: Row) -> Result<(), ZqlError> {
        self.schema.validate(&row)?;
        let pk = self.primary_key_tuple(&row);
        let old_pk = self.primary_key_tuple(&old_row);
        if pk != old_pk {
            return Err(ZqlError::PrimaryKeyEditMismatch {
                table: self.schema.name.clone(),
            });
        }
        self.rows.borrow_mut().insert(pk, row.clone());
        self.persist_add(&row)?;

        let changed_cols: Vec<&str> = row
            .columns()
            .filter(|(c, v)| old_row.get(c).is_none_or(|ov| ov != *v))
            .map(|(c, _)| c)
            .collect();

        for idx in self.indices.borrow_mut().values_mut() {
            let depends = changed_cols.iter().any(|c| idx.ordering.depends_on(c));
            if depends {
                idx.set.delete(&old_row);
                idx.set.add(row.clone());
            } else {
                idx.set.add(row.clone());
            }
        }

        for conn in self.connections.borrow().iter() {
            let idx_key = &conn.order_key;
            let depends = self
                .indices
                .borrow()
                .get(idx_key)
                .is_some_and(|idx| changed_cols.iter().any(|c| idx.ordering.depends_on(c)));
            let old_match = conn.predicate.as_ref().is_none_or(|p| p.eval(&old_row));
            let new_match = conn.predicate.as_ref().is_none_or(|p| p.eval(&row));
            if depends {
                if old_match {
                    Self::emit(conn, Change::Remove(Node::leaf(old_row.clone())));
                }
                if new_match {
                    Self::emit(conn, Change::Add(Node::leaf(row.clone())));
                }
            } else {
                match (old_match, new_match) {
                    (true, true) => Self::emit(
                        conn,
                        Change::Edit {
                            row: row.clone(),
                            old_row: old_row.clone(),
                        },
                    ),
                    (true, false) => Self::emit(conn, Change::Remove(Node::leaf(old_row.clone()))),
                    (false, true) => Self::emit(conn, Change::Add(Node::leaf(row.clone()))),
                    (false, false) => {}
                }
            }
        }
        Ok(())
    }

    fn emit(conn: &Rc<ConnEntry>, change: Change) {
        if let Some(output) = conn.output.borrow().as_ref().and_then(Weak::upgrade) {
            output.push(change, InputSide::Primary);
        }
    }

    fn persist_add(&self, row: &Row) -> Result<(), ZqlError> {
        if let RowStorage::Sqlite(conn) = &self.storage {
            let pk = self.primary_key_tuple(row);
            let key: StorageKey = pk.iter().map(|v| format!("{v:?}").into_bytes()).collect();
            let value = serde_json::to_vec(&row_to_json(row)).expect("Row serializes to JSON");
            conn.borrow_mut().set(key, value)?;
        }
        Ok(())
    }

    fn persist_remove(&self, row: &Row) -> Result<(), ZqlError> {
        if let RowStorage::Sqlite(conn) = &self.storage {
            let pk = self.primary_key_tuple(row);
            let key: StorageKey = pk.iter().map(|v| format!("{v:?}").into_bytes()).collect();
            conn.borrow_mut().del(&key)?;
        }
        Ok(())
    }
}

fn row_to_json(row: &Row) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = row
        .columns()
        .map(|(k, v)| (k.to_string(), value_to_json(v)))
        .collect();
    serde_json::Value::Object(map)
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Json(j) => j.clone(),
    }
}

/// A stateful handle returned by `Source::connect`: an ordering, an
/// optional pushed predicate, and a (weak, via `Drop`) claim on the
/// shared secondary index. Implements `Input` so operators can `fetch`/
/// `cleanup` through it exactly like any other operator's input.
pub struct SourceConnection {
    source: Rc<Source>,
    entry: Rc<ConnEntry>,
    order_key: OrderKey,
    comparator: RowComparator,
    schema: Schema,
    pub fully_applied_filters: bool,
}

impl SourceConnection {
    pub fn set_output(&self, output: Rc<dyn Output>) {
        *self.entry.output.borrow_mut() = Some(Rc::downgrade(&output));
    }

    fn matching_rows(&self, req: &Req) -> Vec<Row> {
        let indices = self.source.indices.borrow();
        let Some(idx) = indices.get(&self.order_key) else {
            return Vec::new();
        };
        let rows: Vec<Row> = if let Some(start) = &req.start {
            let inclusive = start.basis == crate::operator::Basis::At;
            if req.reverse {
                idx.set.values_from_reversed(&start.row, inclusive).cloned().collect()
            } else {
                idx.set.values_from(&start.row, inclusive).cloned().collect()
            }
        } else if req.reverse {
            idx.set.iter().rev().cloned().collect()
        } else {
            idx.set.iter().cloned().collect()
        };
        let mut matched: Vec<Row> = rows
            .into_iter()
            .filter(|r| {
                req.constraint
                    .as_ref()
                    .is_none_or(|c| r.get(&c.key).unwrap_or(&Value::Null) == &c.value)
            })
            .filter(|r| self.entry.predicate.as_ref().is_none_or(|p| p.eval(r)))
            .collect();
        if let Some(limit) = req.limit {
            matched.truncate(limit);
        }
        matched
    }
}

impl Input for SourceConnection {
    fn schema(&self) -> &Schema {
        // Source connections are leaves: no declared relationships here,
        // callers (Join/Builder) layer relationships on top of the Nodes
        // this connection yields.
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        self.matching_rows(req).into_iter().map(Node::leaf).collect()
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        // Source connections hold no reclaimable per-row state of their
        // own (the shared index outlives any single connection), so
        // cleanup is identical to fetch.
        self.fetch(req)
    }
}

impl PipelineInput for SourceConnection {
    fn attach_output(&self, output: Rc<dyn Output>) {
        self.set_output(output);
    }
}

impl Drop for SourceConnection {
    fn drop(&mut self) {
        self.source.release_index(&self.order_key);
        self.source
            .connections
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, &self.entry));
    }
}

/// A non-owning back-reference a connection can use to re-open another
/// connection on the same Source without holding a strong cycle, per the
/// "Source references its connections / connections reference the
/// Source" guidance in spec §9.
pub struct SourceRef(Weak<Source>);

impl SourceRef {
    pub fn new(source: &Rc<Source>) -> Self {
        SourceRef(Rc::downgrade(source))
    }

    pub fn upgrade(&self) -> Option<Rc<Source>> {
        self.0.upgrade()
    }
}
