//! Join (spec §4.5): a parent-to-children hierarchical join. Each parent
//! row gets a named relationship whose value is the lazy stream of child
//! rows with `child[childKey] = parent[parentKey]`.
//!
//! State lives in a `["pKeySet", hash(parentKeyValue), hash(parentPk)]`
//! marker per currently-admitted parent, so a child-side push can find
//! every parent currently routed to its join-key value, and cleanup can
//! tell whether the last parent referencing a value just left (only then
//! is the child side's own state torn down — `cleanup`, not `fetch`).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::hash::hash_value;
use crate::row::Row;
use crate::storage::{MemStorage, Storage, StorageKey};
use crate::value::Value;

use super::{Change, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema};

fn pkset_prefix(parent_key_value: &Value) -> Vec<Vec<u8>> {
    vec![b"pKeySet".to_vec(), hash_value(parent_key_value).to_le_bytes().to_vec()]
}

fn pkset_entry(parent_key_value: &Value, parent_pk: &Value) -> StorageKey {
    let mut k = pkset_prefix(parent_key_value);
    k.push(hash_value(parent_pk).to_le_bytes().to_vec());
    k
}

/// A thin relay that tags every push from one side of the Join with its
/// `InputSide`, so `Join::push` can tell a parent-origin change from a
/// child-origin one without the two sides needing to know about each
/// other.
struct JoinSide {
    join: Weak<JoinOperator>,
    side: InputSide,
}

impl Output for JoinSide {
    fn push(&self, change: Change, _from: InputSide) {
        if let Some(join) = self.join.upgrade() {
            join.push(change, self.side);
        }
    }
}

pub struct JoinOperator {
    parent: Rc<dyn PipelineInput>,
    child: Rc<dyn PipelineInput>,
    parent_key: String,
    child_key: String,
    relationship: String,
    schema: Schema,
    storage: RefCell<MemStorage>,
    output: RefCell<Option<Weak<dyn Output>>>,
    // Strong-owned relays handed to `parent`/`child` as only a `Weak`
    // (their `output` field can't hold the strong side of this, or
    // parent/child would never be able to drop their downstream). Kept
    // alive here so they outlive the `attach_output` call that wires them.
    _parent_side: Rc<JoinSide>,
    _child_side: Rc<JoinSide>,
}

impl JoinOperator {
    /// Panics (a fatal contract violation, spec §4.5) if `parent` and
    /// `child` are the same operator instance.
    pub fn new(
        parent: Rc<dyn PipelineInput>,
        child: Rc<dyn PipelineInput>,
        parent_key: impl Into<String>,
        child_key: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Rc<Self> {
        if Rc::ptr_eq(&parent, &child) {
            crate::error::fatal("Join::new", "parent and child are the same operator instance");
        }
        let relationship = relationship.into();
        let parent_schema = parent.schema().clone();
        let child_schema = child.schema().clone();
        let schema = parent_schema.with_relationship(relationship.clone(), child_schema);

        let parent_key = parent_key.into();
        let child_key = child_key.into();
        Rc::new_cyclic(|weak_join| {
            let parent_side = Rc::new(JoinSide { join: weak_join.clone(), side: InputSide::Primary });
            let child_side = Rc::new(JoinSide { join: weak_join.clone(), side: InputSide::Secondary });
            parent.attach_output(parent_side.clone());
            child.attach_output(child_side.clone());
            JoinOperator {
                parent,
                child,
                parent_key,
                child_key,
                relationship,
                schema,
                storage: RefCell::new(MemStorage::new()),
                output: RefCell::new(None),
                _parent_side: parent_side,
                _child_side: child_side,
            }
        })
    }

    fn child_factory(&self, parent_key_value: Value) -> super::ChildFactory {
        let child = self.child.clone();
        let child_key = self.child_key.clone();
        Rc::new(move || child.fetch(&Req::with_constraint(child_key.clone(), parent_key_value.clone())))
    }

    fn attach_relationship(&self, node: Node) -> Node {
        let parent_key_value = node.row.get(&self.parent_key).cloned().unwrap_or(Value::Null);
        node.with_relationship(self.relationship.clone(), self.child_factory(parent_key_value))
    }

    fn parent_pk_value(&self, row: &Row) -> Value {
        let pk_cols = &self.parent.schema().primary_key;
        if pk_cols.len() == 1 {
            row.get(&pk_cols[0]).cloned().unwrap_or(Value::Null)
        } else {
            let tuple: Vec<Value> = pk_cols.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
            Value::String(format!("{tuple:?}"))
        }
    }

    fn record_parent(&self, row: &Row) {
        let key_value = row.get(&self.parent_key).cloned().unwrap_or(Value::Null);
        let pk = self.parent_pk_value(row);
        let _ = self.storage.borrow_mut().set(pkset_entry(&key_value, &pk), vec![1]);
    }

    /// Removes this parent from its key-value's set; returns `true` iff
    /// the set is now empty (spec §4.5 cleanup: tear down child state
    /// only when the last referencing parent leaves).
    fn forget_parent(&self, row: &Row) -> bool {
        let key_value = row.get(&self.parent_key).cloned().unwrap_or(Value::Null);
        let pk = self.parent_pk_value(row);
        let mut storage = self.storage.borrow_mut();
        let _ = storage.del(&pkset_entry(&key_value, &pk));
        storage.scan(&pkset_prefix(&key_value), None, Some(1)).map(|v| v.is_empty()).unwrap_or(true)
    }

    fn emit(&self, change: Change) {
        if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
            out.push(change, InputSide::Primary);
        }
    }
}

impl Input for JoinOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        self.parent
            .fetch(req)
            .into_iter()
            .map(|node| {
                self.record_parent(&node.row);
                self.attach_relationship(node)
            })
            .collect()
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        self.parent
            .cleanup(req)
            .into_iter()
            .map(|node| {
                let key_value = node.row.get(&self.parent_key).cloned().unwrap_or(Value::Null);
                let set_now_empty = self.forget_parent(&node.row);
                let child_key = self.child_key.clone();
                let child = self.child.clone();
                let factory: super::ChildFactory = if set_now_empty {
                    Rc::new(move || child.cleanup(&Req::with_constraint(child_key.clone(), key_value.clone())))
                } else {
                    Rc::new(move || child.fetch(&Req::with_constraint(child_key.clone(), key_value.clone())))
                };
                node.with_relationship(self.relationship.clone(), factory)
            })
            .collect()
    }
}

impl Output for JoinOperator {
    fn push(&self, change: Change, from: InputSide) {
        match from {
            InputSide::Primary => self.push_from_parent(change),
            InputSide::Secondary => self.push_from_child(change),
        }
    }
}

impl JoinOperator {
    fn push_from_parent(&self, change: Change) {
        match change {
            Change::Add(node) => {
                self.record_parent(&node.row);
                self.emit(Change::Add(self.attach_relationship(node)));
            }
            Change::Remove(node) => {
                self.forget_parent(&node.row);
                self.emit(Change::Remove(self.attach_relationship(node)));
            }
            Change::Edit { row, old_row } => {
                // The Source splits any edit touching `parent_key` into
                // remove+add before it reaches us; observing one here
                // that actually changed it is a contract violation.
                if row.get(&self.parent_key) != old_row.get(&self.parent_key) {
                    crate::error::fatal("Join::push", "edit changed the parent join key");
                }
                self.emit(Change::Edit { row, old_row });
            }
            Change::Child { row, relationship, change } => {
                self.emit(Change::Child { row, relationship, change });
            }
        }
    }

    fn push_from_child(&self, change: Change) {
        let child_row = change.subject_row().clone();
        let child_key_value = child_row.get(&self.child_key).cloned().unwrap_or(Value::Null);
        let parents = self.parent.fetch(&Req::with_constraint(self.parent_key.clone(), child_key_value));
        for parent in parents {
            self.emit(Change::child(parent.row, self.relationship.clone(), change.clone()));
        }
    }
}

impl Operator for JoinOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for JoinOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}
