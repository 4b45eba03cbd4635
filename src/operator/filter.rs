//! Filter (spec §4.4): stateless row-predicate operator.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::predicate::Predicate;

use super::{Change, Input, InputSide, Node, Operator, Output, PipelineInput, Req, Schema};

pub struct FilterOperator {
    input: Rc<dyn PipelineInput>,
    predicate: Predicate,
    schema: Schema,
    output: RefCell<Option<Weak<dyn Output>>>,
}

impl FilterOperator {
    pub fn new(input: Rc<dyn PipelineInput>, predicate: Predicate) -> Rc<Self> {
        let schema = input.schema().clone();
        let filter = Rc::new(FilterOperator {
            input: input.clone(),
            predicate,
            schema,
            output: RefCell::new(None),
        });
        input.attach_output(filter.clone());
        filter
    }
}

impl Input for FilterOperator {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn fetch(&self, req: &Req) -> Vec<Node> {
        // A predicate can drop rows, so this stage can't promise the
        // caller's requested count survives filtering; don't forward it.
        let unbounded = Req { limit: None, ..req.clone() };
        self.input
            .fetch(&unbounded)
            .into_iter()
            .filter(|n| self.predicate.eval(&n.row))
            .collect()
    }

    fn cleanup(&self, req: &Req) -> Vec<Node> {
        let unbounded = Req { limit: None, ..req.clone() };
        self.input
            .cleanup(&unbounded)
            .into_iter()
            .filter(|n| self.predicate.eval(&n.row))
            .collect()
    }
}

impl Output for FilterOperator {
    fn push(&self, change: Change, _from: InputSide) {
        let forwarded = match change {
            Change::Add(node) => self.predicate.eval(&node.row).then_some(Change::Add(node)),
            Change::Remove(node) => self.predicate.eval(&node.row).then_some(Change::Remove(node)),
            Change::Edit { row, old_row } => {
                let old_ok = self.predicate.eval(&old_row);
                let new_ok = self.predicate.eval(&row);
                match (old_ok, new_ok) {
                    (true, true) => Some(Change::Edit { row, old_row }),
                    (true, false) => Some(Change::Remove(Node::leaf(old_row))),
                    (false, true) => Some(Change::Add(Node::leaf(row))),
                    (false, false) => None,
                }
            }
            Change::Child { row, relationship, change } => {
                self.predicate.eval(&row).then_some(Change::Child { row, relationship, change })
            }
        };
        if let Some(c) = forwarded {
            if let Some(out) = self.output.borrow().as_ref().and_then(Weak::upgrade) {
                out.push(c, InputSide::Primary);
            }
        }
    }
}

impl Operator for FilterOperator {
    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(Rc::downgrade(&output));
    }
}

impl PipelineInput for FilterOperator {
    fn attach_output(&self, output: Rc<dyn Output>) {
        Operator::set_output(self, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Direction, Ordering, Row};
    use crate::value::Value;
    use std::cell::RefCell as Cell;

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

    fn row(id: f64, open: bool) -> Row {
        Row::from_pairs([
            ("id".to_string(), Some(Value::Number(id))),
            ("open".to_string(), Some(Value::Bool(open))),
        ])
    }

    fn schema() -> Schema {
        let ordering = Ordering::new(vec![("id".to_string(), Direction::Asc)]);
        Schema::leaf("issue", vec!["id".to_string()], ordering.comparator())
    }

    #[test]
    fn fetch_filters_rows() {
        let input = Rc::new(FakeInput {
            schema: schema(),
            rows: vec![row(1.0, true), row(2.0, false), row(3.0, true)],
            output: RefCell::new(None),
        });
        let filter = FilterOperator::new(input, Predicate::eq("open", Value::Bool(true)));
        let result = filter.fetch(&Req::none());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn edit_crossing_boundary_rewritten_to_remove_or_add() {
        struct Sink(Cell<Vec<String>>);
        impl Output for Sink {
            fn push(&self, change: Change, _from: InputSide) {
                let label = match change {
                    Change::Add(_) => "add",
                    Change::Remove(_) => "remove",
                    Change::Edit { .. } => "edit",
                    Change::Child { .. } => "child",
                };
                self.0.borrow_mut().push(label.to_string());
            }
        }
        let input = Rc::new(FakeInput { schema: schema(), rows: vec![], output: RefCell::new(None) });
        let filter = FilterOperator::new(input, Predicate::eq("open", Value::Bool(true)));
        let sink = Rc::new(Sink(Cell::new(Vec::new())));
        filter.set_output(sink.clone());

        filter.push(
            Change::Edit { row: row(1.0, false), old_row: row(1.0, true) },
            InputSide::Primary,
        );
        assert_eq!(sink.0.borrow().as_slice(), ["remove"]);

        sink.0.borrow_mut().clear();
        filter.push(
            Change::Edit { row: row(2.0, true), old_row: row(2.0, false) },
            InputSide::Primary,
        );
        assert_eq!(sink.0.borrow().as_slice(), ["add"]);
    }
}
