//! Take (spec §4.7): limit with an optional partition key.
//!
//! Per partition value (or a single global partition when there is no
//! partition key) this tracks `(size, bound)`, where `bound` is the
//! greatest currently-admitted row under the operator's ordering. `size`
//! never exceeds `limit`; eviction on `push(add)` and backfill on
//! `push(remove)` both re-derive the new bound from the parent input
//! rather than guessing it, so Take never needs its own copy of rows
//! beyond the single boundary one per partition.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::row::{Row, RowComparator};
use crate::value::Value;

use super::{Basis, Change, Constraint, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema, StartBound};

struct PartitionState {
    size: usize,
    bound: Option<Row>,
}

pub struct TakeOperator {
    input: Rc<dyn PipelineInput>,
    limit: usize,
    partition_key: Option<String>,
    schema: Schema,
    comparator: RowComparator,
    partitions: RefCell<BTreeMap<Option<Value>, PartitionState>>,
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl TakeOperator {
    pub fn new(input: Rc<dyn PipelineInput>, limit: usize, partition_key: Option<String>) -> Rc<Self> {
        let schema = input.schema().clone();
        let comparator = schema.comparator.clone();
        let take = Rc::new(TakeOperator {
            input: input.clone(),
            limit,
            partition_key,
            schema,
            comparator,
            partitions: RefCell::new(BTreeMap::new()),
            output: RefCell::new(None),
        });
        input.attach_output(take.clone());
        take
    }

    fn partition_value(&self, row: &Row) -> Option<Value> {
        self.partition_key.as_ref().map(|k| row.get(k).cloned().unwrap_or(Value::Null))
    }

    fn req(&self, partition: &Option<Value>, start: Option<StartBound>, reverse: bool) -> Req {
        let constraint = match (&self.partition_key, partition) {
            (Some(key), Some(value)) => Some(Constraint { key: key.clone(), value: value.clone() }),
            _ => None,
        };
        Req { constraint, start, reverse, limit: None }
    }

    fn emit(&self, change: Change) {
        if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
            out.push(change, InputSide::Primary);
        }
    }

    /// The request this stage issues upstream for a full-stream pull:
    /// plain requests get our own `limit` as an upper-bound hint on the
    /// unpartitioned count when there's no partition key to defeat it,
    /// since the upstream stage is then 1:1 on row count with us. A
    /// partitioned Take can't bound its pull this way: a fresh partition
    /// value may show up anywhere in the stream, so every row must be
    /// seen to know each partition's quota is actually satisfied.
    fn bounded(&self, req: &Req) -> Req {
        let own_limit = if self.partition_key.is_none() { Some(self.limit) } else { None };
        let limit = match (req.limit, own_limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        Req { limit, ..req.clone() }
    }

    /// Truncates `nodes` to at most `self.limit` per partition, updating
    /// `self.partitions` either with the resulting bound (`forget =
    /// false`, the `fetch` path) or by dropping the partition's state
    /// entirely (`forget = true`, the `cleanup` path, since upstream has
    /// just released whatever storage it held for these rows).
    fn admit(&self, nodes: Vec<Node>, forget: bool) -> Vec<Node> {
        let mut counts: BTreeMap<Option<Value>, usize> = BTreeMap::new();
        let mut out = Vec::new();
        for node in nodes {
            let p = self.partition_value(&node.row);
            let c = counts.entry(p).or_insert(0);
            if *c < self.limit {
                *c += 1;
                out.push(node);
            }
        }
        let mut partitions = self.partitions.borrow_mut();
        if forget {
            for p in counts.into_keys() {
                partitions.remove(&p);
            }
        } else {
            for (p, size) in counts {
                let bound = out.iter().rev().find(|n| self.partition_value(&n.row) == p).map(|n| n.row.clone());
                partitions.insert(p, PartitionState { size, bound });
            }
        }
        out
    }

    /// The greatest node strictly less than `bound` still visible through
    /// the parent input, for the same partition. Returns the full `Node`
    /// (relationship factories included) since a promoted row must carry
    /// its children into the `Add` it's emitted as.
    fn row_before(&self, partition: &Option<Value>, bound: &Row) -> Option<Node> {
        let req = self.req(partition, Some(StartBound { row: bound.clone(), basis: Basis::After }), true);
        self.input.fetch(&req).into_iter().next()
    }

    /// The least node strictly greater than `bound` still visible through
    /// the parent input, for the same partition.
    fn row_after(&self, partition: &Option<Value>, bound: &Row) -> Option<Node> {
        let req = self.req(partition, Some(StartBound { row: bound.clone(), basis: Basis::After }), false);
        self.input.fetch(&req).into_iter().next()
    }
}

impl Input for TakeOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        let rows = self.input.fetch(&self.bounded(req));
        self.admit(rows, false)
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        let rows = self.input.cleanup(&self.bounded(req));
        self.admit(rows, true)
    }
}

impl Output for TakeOperator {
    fn push(&self, change: Change, from: InputSide) {
        match change {
            Change::Add(node) => self.push_add(node),
            Change::Remove(node) => self.push_remove(node.row),
            Change::Edit { row, old_row } => self.push_edit(row, old_row),
            Change::Child { row, relationship, change } => self.push_child(row, relationship, *change),
        }
        let _ = from;
    }
}

impl TakeOperator {
    /// Takes the whole incoming `Node` (not just its `Row`) so a newly
    /// admitted row keeps the relationship factories a Join upstream
    /// attached to it.
    fn push_add(&self, node: Node) {
        if self.limit == 0 {
            return;
        }
        let row = node.row.clone();
        let partition = self.partition_value(&row);
        let mut partitions = self.partitions.borrow_mut();
        let state = partitions
            .entry(partition.clone())
            .or_insert_with(|| PartitionState { size: 0, bound: None });

        if state.size < self.limit {
            state.size += 1;
            if state.bound.as_ref().is_none_or(|b| self.comparator.compare(&row, b) == CmpOrdering::Greater) {
                state.bound = Some(row.clone());
            }
            drop(partitions);
            self.emit(Change::Add(node));
            return;
        }

        let bound = state.bound.clone().expect("size == limit > 0 implies a bound is recorded");
        if self.comparator.compare(&row, &bound) != CmpOrdering::Less {
            return; // row >= bound: not admitted
        }
        drop(partitions);
        let new_bound = self.row_before(&partition, &bound).map(|n| n.row);
        self.partitions.borrow_mut().get_mut(&partition).unwrap().bound = new_bound;
        self.emit(Change::Remove(Node::leaf(bound)));
        self.emit(Change::Add(node));
    }

    fn push_remove(&self, row: Row) {
        let partition = self.partition_value(&row);
        let mut partitions = self.partitions.borrow_mut();
        let Some(state) = partitions.get_mut(&partition) else {
            return;
        };
        let Some(bound) = state.bound.clone() else {
            return;
        };
        if self.comparator.compare(&row, &bound) == CmpOrdering::Greater {
            return; // not admitted
        }
        drop(partitions);
        self.emit(Change::Remove(Node::leaf(row.clone())));

        if let Some(next) = self.row_after(&partition, &bound) {
            let mut partitions = self.partitions.borrow_mut();
            let state = partitions.get_mut(&partition).unwrap();
            state.bound = Some(next.row.clone());
            drop(partitions);
            self.emit(Change::Add(next));
        } else {
            let mut partitions = self.partitions.borrow_mut();
            let state = partitions.get_mut(&partition).unwrap();
            state.size -= 1;
            if self.comparator.compare(&row, &bound) == CmpOrdering::Equal {
                let prev = {
                    drop(partitions);
                    self.row_before(&partition, &bound)
                };
                self.partitions.borrow_mut().get_mut(&partition).unwrap().bound = prev.map(|n| n.row);
            }
        }
    }

    fn push_edit(&self, row: Row, old_row: Row) {
        let partition = self.partition_value(&row);
        let admitted = self
            .partitions
            .borrow()
            .get(&partition)
            .and_then(|s| s.bound.as_ref())
            .is_some_and(|bound| self.comparator.compare(&old_row, bound) != CmpOrdering::Greater);
        if admitted {
            self.emit(Change::Edit { row, old_row });
        }
    }

    fn push_child(&self, row: Row, relationship: String, change: Change) {
        let partition = self.partition_value(&row);
        let admitted = self
            .partitions
            .borrow()
            .get(&partition)
            .and_then(|s| s.bound.as_ref())
            .is_some_and(|bound| self.comparator.compare(&row, bound) != CmpOrdering::Greater);
        if admitted {
            self.emit(Change::child(row, relationship, change));
        }
    }
}

impl Operator for TakeOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for TakeOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Direction, Ordering};

    struct FakeInput {
        schema: Schema,
        rows: RefCell<Vec<Row>>,
        output: RefCell<Option<Rc<dyn Output>>>,
    }
    impl Input for FakeInput {
        fn schema(&self) -> &Schema {
            &self.schema
        }
        fn fetch(&self, req: &Req) -> Vec<Node> {
            let rows = self.rows.borrow();
            let iter = rows.iter().cloned();
            let mut out: Vec<Row> = if let Some(start) = &req.start {
                if req.reverse {
                    iter.filter(|r| r.get("id").unwrap().as_number().unwrap() < start.row.get("id").unwrap().as_number().unwrap()).collect()
                } else {
                    iter.filter(|r| r.get("id").unwrap().as_number().unwrap() > start.row.get("id").unwrap().as_number().unwrap()).collect()
                }
            } else {
                iter.collect()
            };
            if req.reverse {
                out.sort_by(|a, b| b.get("id").unwrap().as_number().partial_cmp(&a.get("id").unwrap().as_number()).unwrap());
            } else {
                out.sort_by(|a, b| a.get("id").unwrap().as_number().partial_cmp(&b.get("id").unwrap().as_number()).unwrap());
            }
            out.into_iter().map(Node::leaf).collect()
        }
        fn cleanup(&self, req: &Req) -> Vec<Node> {
            self.fetch(req)
        }
    }
    impl PipelineInput for FakeInput {
        fn attach_output(&self, output: Rc<dyn Output>) {
            *self.output.borrow_mut() = Some(output);
        }
    }

    fn row(id: f64) -> Row {
        Row::from_pairs([("id".to_string(), Some(Value::Number(id)))])
    }

    fn schema() -> Schema {
        let ordering = Ordering::new(vec![("id".to_string(), Direction::Asc)]);
        Schema::leaf("x", vec!["id".to_string()], ordering.comparator())
    }

    struct Sink(RefCell<Vec<Change>>);
    impl Output for Sink {
        fn push(&self, change: Change, _from: InputSide) {
            self.0.borrow_mut().push(change);
        }
    }

    fn labels(changes: &[Change]) -> Vec<(&'static str, f64)> {
        changes
            .iter()
            .map(|c| match c {
                Change::Add(n) => ("add", n.row.get("id").unwrap().as_number().unwrap()),
                Change::Remove(n) => ("remove", n.row.get("id").unwrap().as_number().unwrap()),
                _ => ("other", 0.0),
            })
            .collect()
    }

    #[test]
    fn fetch_admits_first_limit_rows() {
        let input = Rc::new(FakeInput { schema: schema(), rows: RefCell::new((1..=5).map(|i| row(i as f64)).collect()), output: RefCell::new(None) });
        let take = TakeOperator::new(input, 3, None);
        let result = take.fetch(&Req::none());
        let ids: Vec<f64> = result.iter().map(|n| n.row.get("id").unwrap().as_number().unwrap()).collect();
        assert_eq!(ids, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn s4_take_eviction_scenario() {
        let input = Rc::new(FakeInput { schema: schema(), rows: RefCell::new((1..=5).map(|i| row(i as f64)).collect()), output: RefCell::new(None) });
        let take = TakeOperator::new(input.clone(), 3, None);
        take.fetch(&Req::none());
        input.rows.borrow_mut().push(row(0.0));

        let sink = Rc::new(Sink(RefCell::new(Vec::new())));
        take.set_output(sink.clone());
        take.push(Change::Add(Node::leaf(row(0.0))), InputSide::Primary);

        let changes = sink.0.borrow();
        assert_eq!(labels(&changes), vec![("remove", 3.0), ("add", 0.0)]);
    }
}
