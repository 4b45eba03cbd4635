//! The operator framework (component C4): `Schema`, `Node`, `Change`, the
//! fetch `Req`, and the `Input`/`Output`/`Operator` traits every relational
//! primitive in this module implements.
//!
//! Laziness note: spec §3 describes a Node's `relationships` as lazy
//! streams "only produced when the consumer iterates them." This crate
//! models that as a `Rc<dyn Fn() -> Vec<Node>>` thunk rather than a true
//! streaming iterator — Rust has no stable generators, and a hand-rolled
//! iterator-with-borrowed-operator-state would need unsafe self-referential
//! structures to match the spec's "arena-allocated iterator" guidance. The
//! thunk still defers the relationship's cost until something actually
//! calls it (the View, or a parent Join assembling `fetch` results), which
//! is the semantically load-bearing part of "lazy" here; only the
//! micro-optimization of incremental (rather than all-at-once) yielding is
//! traded away. See DESIGN.md.

pub mod exists;
pub mod filter;
pub mod join;
pub mod skip;
pub mod take;

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::row::{Row, RowComparator};
use crate::value::Value;

/// Columns, primary key, declared relationships, and the comparator for an
/// operator's (or a Source connection's) output ordering — spec §4.3
/// `getSchema()`.
#[derive(Clone)]
pub struct Schema {
    pub name: String,
    pub primary_key: Vec<String>,
    pub relationships: BTreeMap<String, Schema>,
    pub comparator: RowComparator,
}

impl Schema {
    pub fn leaf(name: impl Into<String>, primary_key: Vec<String>, comparator: RowComparator) -> Self {
        Schema {
            name: name.into(),
            primary_key,
            relationships: BTreeMap::new(),
            comparator,
        }
    }

    pub fn with_relationship(mut self, name: impl Into<String>, child: Schema) -> Self {
        self.relationships.insert(name.into(), child);
        self
    }
}

/// A lazily-produced stream of child nodes for one relationship.
pub type ChildFactory = Rc<dyn Fn() -> Vec<Node>>;

/// A row plus its named child-row streams, flowing between operators
/// (spec §3 Node).
#[derive(Clone)]
pub struct Node {
    pub row: Row,
    pub relationships: BTreeMap<String, ChildFactory>,
}

impl Node {
    pub fn leaf(row: Row) -> Self {
        Node {
            row,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(mut self, name: impl Into<String>, factory: ChildFactory) -> Self {
        self.relationships.insert(name.into(), factory);
        self
    }

    /// Materializes every relationship eagerly; used by the View, which
    /// needs a concrete snapshot rather than a lazy thunk.
    pub fn hydrate_relationships(&self) -> BTreeMap<String, Vec<Node>> {
        self.relationships
            .iter()
            .map(|(name, factory)| (name.clone(), factory()))
            .collect()
    }
}

/// One propagated change, per spec §3.
#[derive(Clone)]
pub enum Change {
    Add(Node),
    Remove(Node),
    /// A descendant of `row` changed; `row` itself is unchanged.
    Child {
        row: Row,
        relationship: String,
        change: Box<Change>,
    },
    /// `row`'s non-key fields changed; `row`/`old_row` must agree on
    /// primary key and every sort-order column (spec §3 invariant) — an
    /// edit that would violate this must be split upstream into
    /// `remove`+`add` before reaching an operator.
    Edit { row: Row, old_row: Row },
}

impl Change {
    pub fn child(row: Row, relationship: impl Into<String>, change: Change) -> Self {
        Change::Child {
            row,
            relationship: relationship.into(),
            change: Box::new(change),
        }
    }

    /// The row this change is fundamentally "about" at this level (the
    /// new row for `Add`/`Edit`/`Child`, the departing row for `Remove`).
    pub fn subject_row(&self) -> &Row {
        match self {
            Change::Add(n) => &n.row,
            Change::Remove(n) => &n.row,
            Change::Child { row, .. } => row,
            Change::Edit { row, .. } => row,
        }
    }
}

/// An equality constraint pushed into `fetch`/`cleanup`, e.g. Join
/// requesting only children whose `childKey` equals a parent's key value.
#[derive(Clone)]
pub struct Constraint {
    pub key: String,
    pub value: Value,
}

/// Whether a `start` cursor includes its anchor row.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    At,
    After,
}

#[derive(Clone)]
pub struct StartBound {
    pub row: Row,
    pub basis: Basis,
}

/// Parameters to `fetch`/`cleanup`, per spec §4.3.
///
/// `limit` is an optional upper bound on how many rows the call may
/// produce: a hint a `Take` installs so upstream stages that are 1:1 on
/// row count (a `SourceConnection`, a `Join`'s parent side, a `Cursor`)
/// can stop reading early instead of materializing rows Take would only
/// discard. Any stage that can drop rows (`Filter`, `Exists`, `Skip`)
/// must clear it before forwarding upstream, since it cannot promise the
/// caller's requested count survives its own filtering.
#[derive(Clone, Default)]
pub struct Req {
    pub constraint: Option<Constraint>,
    pub start: Option<StartBound>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl Req {
    pub fn none() -> Self {
        Req::default()
    }

    pub fn with_constraint(key: impl Into<String>, value: Value) -> Self {
        Req {
            constraint: Some(Constraint { key: key.into(), value }),
            start: None,
            reverse: false,
            limit: None,
        }
    }
}

/// Which upstream input a `push` arrived from. Only Join has two distinct
/// inputs (parent, child); every other operator always receives `Primary`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InputSide {
    Primary,
    Secondary,
}

/// Downstream consumers pull from an `Input` via `fetch`/`cleanup`.
pub trait Input {
    fn schema(&self) -> &Schema;

    /// Pure and side-effect free except for strictly-additive
    /// operator-private bookkeeping during hydration (spec §4.3).
    fn fetch(&self, req: &Req) -> Vec<Node>;

    /// Same shape as `fetch`, but authorized to tear down operator state
    /// for the matched rows. Every node returned is considered fully
    /// consumed by the caller (spec §4.3, §5).
    fn cleanup(&self, req: &Req) -> Vec<Node>;
}

/// Upstream producers push a single change at a time to an `Output`.
pub trait Output {
    fn push(&self, change: Change, from: InputSide);
}

/// An operator is simultaneously an `Input` (what's downstream pulls from)
/// and an `Output` (what upstream pushes into); it has exactly one
/// downstream slot, wired once by the builder (spec §4.3, §9 "no dynamic
/// rewiring").
///
/// `set_output`/`attach_output` take a strong `Rc<dyn Output>`, but every
/// implementor stores only `Rc::downgrade(&output)`. The graph's strong
/// ownership runs the other way: each operator's `input` field holds its
/// upstream strongly, so the chain from an externally-held `View`/
/// `QueryHandle` down to the `Source` stays alive exactly as long as the
/// handle does. Storing a strong `output` as well would close every
/// adjacency into a cycle that `Drop` could never break.
pub trait Operator: Input + Output {
    fn set_output(&self, output: Rc<dyn Output>);
}

/// What the builder holds as "the pipeline so far": something downstream
/// can `fetch`/`cleanup` from, and that can have its single output wired
/// once more stages are appended. Both `SourceConnection` and every
/// concrete operator implement this, so the builder can thread a single
/// `Rc<dyn PipelineInput>` through arbitrary operator chains without
/// knowing each stage's concrete type (spec §9: "bottom-up... each
/// operator receives its inputs by construction").
pub trait PipelineInput: Input {
    fn attach_output(&self, output: Rc<dyn Output>);
}
