//! Exists / NotExists (spec §4.6): parent rows gated on whether a named
//! relationship currently has ≥1 child.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::hash::hash_values;
use crate::storage::{MemStorage, Storage, StorageKey};

use super::{Change, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema};

fn pk_key(row: &crate::row::Row, pk_cols: &[String]) -> StorageKey {
    let values: Vec<_> = pk_cols.iter().map(|c| row.get(c).cloned().unwrap_or(crate::value::Value::Null)).collect();
    vec![hash_values(values.iter()).to_le_bytes().to_vec()]
}

fn read_count(storage: &MemStorage, key: &StorageKey) -> u64 {
    storage
        .get(key)
        .ok()
        .flatten()
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

fn write_count(storage: &mut MemStorage, key: StorageKey, count: u64) {
    // `MemStorage` never fails; these results are infallible by construction.
    if count == 0 {
        let _ = storage.del(&key);
    } else {
        let _ = storage.set(key, count.to_le_bytes().to_vec());
    }
}

pub struct ExistsOperator {
    input: Rc<dyn PipelineInput>,
    relationship: String,
    /// `true` for `NOT EXISTS`.
    negate: bool,
    schema: Schema,
    pk_cols: Vec<String>,
    storage: RefCell<MemStorage>,
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl ExistsOperator {
    pub fn new(input: Rc<dyn PipelineInput>, relationship: impl Into<String>, negate: bool) -> Rc<Self> {
        let schema = input.schema().clone();
        let pk_cols = schema.primary_key.clone();
        let exists = Rc::new(ExistsOperator {
            input: input.clone(),
            relationship: relationship.into(),
            negate,
            schema,
            pk_cols,
            storage: RefCell::new(MemStorage::new()),
            output: RefCell::new(None),
        });
        input.attach_output(exists.clone());
        exists
    }

    fn qualifies(&self, count: u64) -> bool {
        (count > 0) != self.negate
    }

    fn relationship_count(&self, node: &Node) -> u64 {
        node.relationships
            .get(&self.relationship)
            .map(|factory| factory().len() as u64)
            .unwrap_or(0)
    }

    /// Re-fetches the full node for `row` from upstream so a 0/1 transition
    /// emits a row carrying every relationship it has, not just the one
    /// whose count just changed.
    fn full_node(&self, row: &crate::row::Row) -> Node {
        self.input
            .fetch(&Req::none())
            .into_iter()
            .find(|n| self.pk_cols.iter().all(|c| n.row.get(c) == row.get(c)))
            .unwrap_or_else(|| Node::leaf(row.clone()))
    }
}

impl Input for ExistsOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        // Qualifying on relationship count can drop rows, so the caller's
        // requested count isn't guaranteed to survive; don't forward it.
        let unbounded = Req { limit: None, ..req.clone() };
        let mut storage = self.storage.borrow_mut();
        self.input
            .fetch(&unbounded)
            .into_iter()
            .filter_map(|node| {
                let count = self.relationship_count(&node);
                write_count(&mut storage, pk_key(&node.row, &self.pk_cols), count);
                self.qualifies(count).then_some(node)
            })
            .collect()
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        let unbounded = Req { limit: None, ..req.clone() };
        let mut storage = self.storage.borrow_mut();
        self.input
            .cleanup(&unbounded)
            .into_iter()
            .filter_map(|node| {
                let key = pk_key(&node.row, &self.pk_cols);
                let count = read_count(&storage, &key);
                storage.del(&key).ok();
                self.qualifies(count).then_some(node)
            })
            .collect()
    }
}

impl Output for ExistsOperator {
    fn push(&self, change: Change, from: InputSide) {
        match change {
            Change::Add(node) => {
                let count = self.relationship_count(&node);
                write_count(&mut self.storage.borrow_mut(), pk_key(&node.row, &self.pk_cols), count);
                if self.qualifies(count) {
                    self.emit(Change::Add(node));
                }
            }
            Change::Remove(node) => {
                let key = pk_key(&node.row, &self.pk_cols);
                let count = read_count(&self.storage.borrow(), &key);
                self.storage.borrow_mut().del(&key).ok();
                if self.qualifies(count) {
                    self.emit(Change::Remove(node));
                }
            }
            Change::Edit { row, old_row } => {
                let key = pk_key(&row, &self.pk_cols);
                let count = read_count(&self.storage.borrow(), &key);
                if self.qualifies(count) {
                    self.emit(Change::Edit { row, old_row });
                }
            }
            Change::Child { row, relationship, change } if relationship == self.relationship => {
                self.handle_relationship_change(row, *change);
            }
            Change::Child { row, relationship, change } => {
                let key = pk_key(&row, &self.pk_cols);
                let count = read_count(&self.storage.borrow(), &key);
                if self.qualifies(count) {
                    self.emit(Change::Child { row, relationship, change });
                }
            }
        }
        let _ = from;
    }
}

impl ExistsOperator {
    fn emit(&self, change: Change) {
        if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
            out.push(change, InputSide::Primary);
        }
    }

    fn handle_relationship_change(&self, row: crate::row::Row, inner: Change) {
        let key = pk_key(&row, &self.pk_cols);
        let before = read_count(&self.storage.borrow(), &key);
        let (after, crossing_add) = match &inner {
            Change::Add(_) => (before + 1, Some(true)),
            Change::Remove(_) => (before.saturating_sub(1), Some(false)),
            Change::Edit { .. } | Change::Child { .. } => (before, None),
        };
        write_count(&mut self.storage.borrow_mut(), key, after);

        match crossing_add {
            Some(true) if after == 1 => {
                // 0 -> 1
                if !self.negate {
                    self.emit(Change::Add(self.full_node(&row)));
                } else {
                    self.emit(Change::Remove(Node::leaf(row)));
                }
            }
            Some(false) if after == 0 => {
                // 1 -> 0
                if !self.negate {
                    self.emit(Change::Remove(Node::leaf(row)));
                } else {
                    self.emit(Change::Add(self.full_node(&row)));
                }
            }
            _ => {
                // Did not cross the 0/1 boundary: for EXISTS this is a
                // `child` change on an already-qualifying parent; for
                // NOT EXISTS the parent isn't part of the result either
                // way, so drop it.
                if !self.negate && after > 0 {
                    self.emit(Change::child(row, self.relationship.clone(), inner));
                }
            }
        }
    }
}

impl Operator for ExistsOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for ExistsOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}
