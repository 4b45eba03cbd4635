//! The canonical [`Row`] type, [`TableSchema`], and [`Ordering`] /
//! comparator machinery (component C1 of the engine).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ZqlError;
use crate::value::{normalize, Value};

/// A single column's declared type, used only for schema validation on
/// ingestion — the dataflow itself is dynamically typed over [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Number,
    String,
    Json,
}

impl ColumnType {
    fn matches(&self, v: &Value) -> bool {
        match (self, v) {
            (_, Value::Null) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Number, Value::Number(_)) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Json, _) => true,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Number => "number",
            ColumnType::String => "string",
            ColumnType::Json => "json",
        }
    }
}

/// Declared type and optionality of one column.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub ty: ColumnType,
    pub optional: bool,
}

/// A relationship declared on a table: the child table name and the
/// column pair joining parent to child (`parent[parent_key] =
/// child[child_key]`).
#[derive(Debug, Clone)]
pub struct RelationshipSchema {
    pub child_table: String,
    pub parent_key: String,
    pub child_key: String,
}

/// `{name, columns, primaryKey}` plus declared relationships, per spec §3.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: BTreeMap<String, ColumnSchema>,
    /// Ordered, non-empty. Primary-key columns are always non-optional.
    pub primary_key: Vec<String>,
    pub relationships: BTreeMap<String, RelationshipSchema>,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: BTreeMap<String, ColumnSchema>,
        primary_key: Vec<String>,
    ) -> Self {
        assert!(!primary_key.is_empty(), "primary key must be non-empty");
        for pk in &primary_key {
            assert!(
                columns.get(pk).is_some_and(|c| !c.optional),
                "primary key column '{pk}' must be declared and non-optional"
            );
        }
        TableSchema {
            name: name.into(),
            columns,
            primary_key,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        rel: RelationshipSchema,
    ) -> Self {
        self.relationships.insert(name.into(), rel);
        self
    }

    /// Validates a row against this schema: missing required columns,
    /// type mismatches, and null primary-key columns are all schema
    /// violations (spec §7).
    pub fn validate(&self, row: &Row) -> Result<(), ZqlError> {
        for (col, spec) in &self.columns {
            match row.get(col) {
                Some(v) => {
                    if !spec.ty.matches(v) {
                        return Err(ZqlError::TypeMismatch {
                            table: self.name.clone(),
                            column: col.clone(),
                            expected: spec.ty.name(),
                        });
                    }
                }
                None if !spec.optional => {
                    return Err(ZqlError::MissingColumn {
                        table: self.name.clone(),
                        column: col.clone(),
                    });
                }
                None => {}
            }
        }
        for pk in &self.primary_key {
            if row.get(pk).is_none_or(Value::is_null) {
                return Err(ZqlError::NullPrimaryKey {
                    table: self.name.clone(),
                    column: pk.clone(),
                });
            }
        }
        Ok(())
    }

    /// Extracts the primary-key tuple from a row. Panics if the row was
    /// not validated against this schema first (a contract violation, not
    /// a user-facing error).
    pub fn primary_key_of<'a>(&self, row: &'a Row) -> Vec<&'a Value> {
        self.primary_key
            .iter()
            .map(|c| row.get(c).unwrap_or(&Value::Null))
            .collect()
    }
}

/// An immutable mapping from column name to [`Value`]. Cheap to clone
/// (an `Arc`-shared map), matching how Nodes are passed around operator
/// chains without deep copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(Arc<BTreeMap<String, Value>>);

impl Row {
    pub fn new(columns: BTreeMap<String, Value>) -> Self {
        Row(Arc::new(columns))
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        Row(Arc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect(),
        ))
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.0.get(col)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Sort direction for one ordering component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(s: &str) -> Result<Self, ZqlError> {
        match s {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(ZqlError::InvalidOrderDirection(other.to_string())),
        }
    }
}

/// A non-empty ordered list of `(column, direction)`. Always extended (by
/// the builder, at connection time) to end with primary-key asc so the
/// composite comparator is a total order, per spec §3.
#[derive(Debug, Clone)]
pub struct Ordering(Vec<(String, Direction)>);

impl Ordering {
    pub fn new(components: Vec<(String, Direction)>) -> Self {
        assert!(!components.is_empty(), "ordering must be non-empty");
        Ordering(components)
    }

    pub fn components(&self) -> &[(String, Direction)] {
        &self.0
    }

    /// Columns this ordering already mentions (for the "extended ... if
    /// not already a superset" rule in spec §4.10).
    fn mentions(&self, col: &str) -> bool {
        self.0.iter().any(|(c, _)| c == col)
    }

    /// Returns this ordering extended with primary-key ascending for any
    /// primary-key column not already present.
    pub fn extended_with_primary_key(mut self, primary_key: &[String]) -> Self {
        for pk in primary_key {
            if !self.mentions(pk) {
                self.0.push((pk.clone(), Direction::Asc));
            }
        }
        Ordering(self.0)
    }

    /// Whether a column changing would move a row's position under this
    /// ordering — i.e. the column appears in the ordering at all.
    pub fn depends_on(&self, col: &str) -> bool {
        self.mentions(col)
    }

    /// Compiles this ordering into a row comparator. Compiled once at
    /// build time (per the Design Notes in spec §9) and shared by value
    /// across every connection/operator that requests the same ordering.
    pub fn comparator(&self) -> RowComparator {
        RowComparator {
            components: self.0.clone(),
        }
    }
}

/// A precompiled comparator derived from an [`Ordering`]. Cheap to clone
/// and share across connections with equal orderings (spec §4.1 Design
/// Notes: "derive once per Ordering at build time; share across
/// connections with equal orderings").
#[derive(Debug, Clone)]
pub struct RowComparator {
    components: Vec<(String, Direction)>,
}

impl RowComparator {
    pub fn compare(&self, a: &Row, b: &Row) -> CmpOrdering {
        for (col, dir) in &self.components {
            let va = a.get(col).unwrap_or(&Value::Null);
            let vb = b.get(col).unwrap_or(&Value::Null);
            let ord = va.cmp(vb);
            let ord = match dir {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != CmpOrdering::Equal {
                return ord;
            }
        }
        CmpOrdering::Equal
    }
}
