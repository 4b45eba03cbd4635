//! The View materializer (spec §4.9): the terminal consumer of a pipeline,
//! holding the current, fully hydrated result tree and a user listener.
//!
//! Results are kept as a sorted `Vec<MaterializedNode>` per level rather
//! than an `OrderedSet`, because applying a `Child` change means mutating
//! one entry's nested children in place — something a set replacing whole
//! values on `add` can't do cheaply. Position lookups at every level use
//! `binary_search_by` against that level's own schema comparator (a Join's
//! relationship has its own ordering, independent of its parent's).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::operator::{Change, Input, InputSide, Node, Output, PipelineInput, Req, Schema};
use crate::row::Row;

/// A fully hydrated row: children materialized eagerly, recursively, in
/// their relationship's own sort order.
#[derive(Clone)]
pub struct MaterializedNode {
    pub row: Row,
    pub relationships: BTreeMap<String, Vec<MaterializedNode>>,
}

fn materialize(node: Node, schema: &Schema) -> MaterializedNode {
    let mut relationships = BTreeMap::new();
    for (name, child_schema) in &schema.relationships {
        let mut children: Vec<MaterializedNode> = node
            .relationships
            .get(name)
            .map(|factory| factory())
            .unwrap_or_default()
            .into_iter()
            .map(|child| materialize(child, child_schema))
            .collect();
        children.sort_by(|a, b| child_schema.comparator.compare(&a.row, &b.row));
        relationships.insert(name.clone(), children);
    }
    MaterializedNode { row: node.row, relationships }
}

fn find_index(nodes: &[MaterializedNode], schema: &Schema, row: &Row) -> Result<usize, usize> {
    nodes.binary_search_by(|n| schema.comparator.compare(&n.row, row))
}

fn apply_at(nodes: &mut Vec<MaterializedNode>, schema: &Schema, change: Change) {
    match change {
        Change::Add(node) => {
            let materialized = materialize(node, schema);
            match find_index(nodes, schema, &materialized.row) {
                Ok(idx) => nodes[idx] = materialized, // re-add of an already-present row: replace wholesale
                Err(idx) => nodes.insert(idx, materialized),
            }
        }
        Change::Remove(node) => {
            if let Ok(idx) = find_index(nodes, schema, &node.row) {
                nodes.remove(idx);
            }
        }
        Change::Edit { row, old_row } => {
            // `row`/`old_row` agree on every sort-order column (the
            // universal edit invariant), so position never changes; only
            // the stored row is replaced, preserving materialized children.
            if let Ok(idx) = find_index(nodes, schema, &old_row) {
                nodes[idx].row = row;
            }
        }
        Change::Child { row, relationship, change } => {
            if let Ok(idx) = find_index(nodes, schema, &row) {
                let Some(child_schema) = schema.relationships.get(&relationship) else {
                    crate::error::fatal("View::apply_at", format!("undeclared relationship '{relationship}'"));
                };
                let children = nodes[idx].relationships.entry(relationship).or_default();
                apply_at(children, child_schema, *change);
            }
        }
    }
}

/// The terminal consumer wired to the last stage of a query's pipeline.
/// Holds the current result and invokes its listeners synchronously, in
/// registration order, exactly once per top-level `push` (and once after
/// `hydrate`) — spec §6 "Listener contract."
pub struct View {
    input: Rc<dyn PipelineInput>,
    schema: Schema,
    rows: RefCell<Vec<MaterializedNode>>,
    listeners: RefCell<BTreeMap<u64, Box<dyn Fn(&[MaterializedNode])>>>,
    next_listener_id: RefCell<u64>,
    hydrated: RefCell<bool>,
}

impl View {
    pub fn new(input: Rc<dyn PipelineInput>) -> Rc<Self> {
        let schema = input.schema().clone();
        let view = Rc::new(View {
            input: input.clone(),
            schema,
            rows: RefCell::new(Vec::new()),
            listeners: RefCell::new(BTreeMap::new()),
            next_listener_id: RefCell::new(0),
            hydrated: RefCell::new(false),
        });
        input.attach_output(view.clone());
        view
    }

    /// Registers a listener, invoked in registration order on every future
    /// change. Per spec §6, a listener added after hydration is invoked
    /// immediately with the current snapshot.
    pub fn add_listener(&self, listener: Box<dyn Fn(&[MaterializedNode])>) -> u64 {
        let id = {
            let mut next = self.next_listener_id.borrow_mut();
            let id = *next;
            *next += 1;
            id
        };
        if *self.hydrated.borrow() {
            listener(&self.rows.borrow());
        }
        self.listeners.borrow_mut().insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.borrow_mut().remove(&id);
    }

    /// Performs the initial full materialization and fires every listener
    /// registered so far, once, with the hydrated result.
    pub fn hydrate(&self) {
        let nodes = self.input.fetch(&Req::none());
        *self.rows.borrow_mut() = nodes.into_iter().map(|n| materialize(n, &self.schema)).collect();
        *self.hydrated.borrow_mut() = true;
        self.notify();
    }

    pub fn current(&self) -> Vec<MaterializedNode> {
        self.rows.borrow().clone()
    }

    fn notify(&self) {
        let rows = self.rows.borrow();
        for listener in self.listeners.borrow().values() {
            listener(&rows);
        }
    }
}

impl Output for View {
    fn push(&self, change: Change, _from: InputSide) {
        apply_at(&mut self.rows.borrow_mut(), &self.schema, change);
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Direction, Ordering};
    use crate::value::Value;
    use std::cell::RefCell as Cell;

    struct FakeInput {
        schema: Schema,
        nodes: Vec<Node>,
        output: RefCell<Option<Rc<dyn Output>>>,
    }
    impl Input for FakeInput {
        fn schema(&self) -> &Schema {
            &self.schema
        }
        fn fetch(&self, _req: &Req) -> Vec<Node> {
            self.nodes.clone()
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

    fn leaf_schema(name: &str) -> Schema {
        let ordering = Ordering::new(vec![("id".to_string(), Direction::Asc)]);
        Schema::leaf(name, vec!["id".to_string()], ordering.comparator())
    }

    #[test]
    fn hydrate_materializes_nested_relationships_in_order() {
        let child_schema = leaf_schema("comment");
        let schema = leaf_schema("issue").with_relationship("comments", child_schema);
        let node = Node::leaf(row(1.0)).with_relationship(
            "comments",
            Rc::new(|| vec![Node::leaf(row(20.0)), Node::leaf(row(10.0))]),
        );
        let input = Rc::new(FakeInput { schema, nodes: vec![node], output: RefCell::new(None) });
        let view = View::new(input);
        view.hydrate();

        let rows = view.current();
        assert_eq!(rows.len(), 1);
        let comments = &rows[0].relationships["comments"];
        let ids: Vec<f64> = comments.iter().map(|c| c.row.get("id").unwrap().as_number().unwrap()).collect();
        assert_eq!(ids, vec![10.0, 20.0], "children sorted by their own schema's comparator");
    }

    #[test]
    fn push_add_insert_and_listener_fires_once() {
        let schema = leaf_schema("issue");
        let input = Rc::new(FakeInput { schema, nodes: vec![], output: RefCell::new(None) });
        let view = View::new(input);

        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        view.add_listener(Box::new(move |_| *calls2.borrow_mut() += 1));
        view.hydrate();
        assert_eq!(*calls.borrow(), 1, "hydrate fires the listener once");

        view.push(Change::Add(Node::leaf(row(5.0))), InputSide::Primary);
        assert_eq!(*calls.borrow(), 2);
        assert_eq!(view.current().len(), 1);
    }

    #[test]
    fn push_edit_preserves_materialized_children() {
        let child_schema = leaf_schema("comment");
        let schema = leaf_schema("issue").with_relationship("comments", child_schema);
        let node = Node::leaf(row(1.0)).with_relationship("comments", Rc::new(|| vec![Node::leaf(row(9.0))]));
        let input = Rc::new(FakeInput { schema, nodes: vec![node], output: RefCell::new(None) });
        let view = View::new(input);
        view.hydrate();

        view.push(
            Change::Edit { row: row(1.0), old_row: row(1.0) },
            InputSide::Primary,
        );
        let rows = view.current();
        assert_eq!(rows[0].relationships["comments"].len(), 1, "edit must not drop prior children");
    }
}
