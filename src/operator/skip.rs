//! Skip (spec §4.8): stateless row-count offset, paired with Take to
//! implement `start`/cursor pagination. Unlike Take, Skip keeps no
//! per-partition bookkeeping of its own — it re-derives "is this row
//! within the first `offset` under the ordering" by asking the parent
//! for a strict count each time, since the boundary only ever needs to
//! be checked against a single anchor row supplied by the builder.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::row::{Row, RowComparator};

use super::{Change, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema};

pub struct SkipOperator {
    input: Rc<dyn PipelineInput>,
    offset: usize,
    schema: Schema,
    comparator: RowComparator,
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl SkipOperator {
    pub fn new(input: Rc<dyn PipelineInput>, offset: usize) -> Rc<Self> {
        let schema = input.schema().clone();
        let comparator = schema.comparator.clone();
        let skip = Rc::new(SkipOperator { input: input.clone(), offset, schema, comparator, output: RefCell::new(None) });
        input.attach_output(skip.clone());
        skip
    }

    fn emit(&self, change: Change) {
        if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
            out.push(change, InputSide::Primary);
        }
    }

    /// How many rows the parent currently holds strictly before `row`
    /// under this ordering, capped at `offset + 1` (we only need to know
    /// whether it's `< offset`, `== offset`, or `> offset`).
    fn rank_before(&self, row: &Row) -> usize {
        let req = Req { constraint: None, start: None, reverse: false, limit: None };
        self.input
            .fetch(&req)
            .into_iter()
            .take_while(|n| self.comparator.compare(&n.row, row) == std::cmp::Ordering::Less)
            .count()
    }
}

impl Input for SkipOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        // Dropping the first `offset` rows means this stage can't promise
        // the caller's requested count survives, so don't forward `limit`.
        let unbounded = Req { limit: None, ..req.clone() };
        self.input.fetch(&unbounded).into_iter().skip(self.offset).collect()
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        let unbounded = Req { limit: None, ..req.clone() };
        self.input.cleanup(&unbounded).into_iter().skip(self.offset).collect()
    }
}

impl Output for SkipOperator {
    fn push(&self, change: Change, _from: InputSide) {
        match change {
            Change::Add(node) => {
                if self.offset == 0 || self.rank_before(&node.row) >= self.offset {
                    self.emit(Change::Add(node));
                }
            }
            Change::Remove(node) => {
                if self.offset == 0 || self.rank_before(&node.row) >= self.offset {
                    self.emit(Change::Remove(node));
                }
            }
            Change::Edit { row, old_row } => {
                if self.offset == 0 || self.rank_before(&old_row) >= self.offset {
                    self.emit(Change::Edit { row, old_row });
                }
            }
            Change::Child { row, relationship, change } => {
                if self.offset == 0 || self.rank_before(&row) >= self.offset {
                    self.emit(Change::child(row, relationship, *change));
                }
            }
        }
    }
}

impl Operator for SkipOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for SkipOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Direction, Ordering};
    use crate::value::Value;

    struct FakeInput {
        schema: Schema,
        rows: Vec<Row>,
        output: RefCell<Option<Rc<dyn Output>>>,
    }
    impl Input for FakeInput {
        fn schema(&self) -> &Schema {
            &self.schema
        }
        fn fetch(&self, _req: &Req) -> Vec<Node> {
            self.rows.iter().cloned().map(Node::leaf).collect()
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

    #[test]
    fn fetch_drops_first_offset_rows() {
        let input = Rc::new(FakeInput { schema: schema(), rows: (1..=5).map(|i| row(i as f64)).collect(), output: RefCell::new(None) });
        let skip = SkipOperator::new(input, 2);
        let result = skip.fetch(&Req::none());
        let ids: Vec<f64> = result.iter().map(|n| n.row.get("id").unwrap().as_number().unwrap()).collect();
        assert_eq!(ids, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn push_drops_rows_within_the_offset_window() {
        let input = Rc::new(FakeInput { schema: schema(), rows: (1..=5).map(|i| row(i as f64)).collect(), output: RefCell::new(None) });
        let skip = SkipOperator::new(input, 2);
        struct Sink(RefCell<Vec<f64>>);
        impl Output for Sink {
            fn push(&self, change: Change, _from: InputSide) {
                if let Change::Add(n) = change {
                    self.0.borrow_mut().push(n.row.get("id").unwrap().as_number().unwrap());
                }
            }
        }
        let sink = Rc::new(Sink(RefCell::new(Vec::new())));
        skip.set_output(sink.clone());
        skip.push(Change::Add(Node::leaf(row(1.0))), InputSide::Primary);
        assert!(sink.0.borrow().is_empty());
    }
}
