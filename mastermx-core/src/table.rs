//! Tabular model for the master object
//!
//! A `Table` is an ordered list of rows sharing one `Schema`. The master
//! schema has 13 typed columns; tables decoded from storage may drift from it
//! (extra, missing or retyped columns). Drift is reported, never rejected.
//!
//! The logical key of a row is its `(tow, net)` pair. It must be unique
//! across rows before a table may be saved.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Column names forming the logical key, in order
pub const LOGICAL_KEY: [&str; 2] = ["tow", "net"];

/// The canonical 13-column layout of the master object
pub const MASTER_COLUMNS: [(&str, ColumnType); 13] = [
    ("cruise", ColumnType::Text),
    ("station", ColumnType::Text),
    ("tow", ColumnType::Integer),
    ("net", ColumnType::Integer),
    ("latitude", ColumnType::Float),
    ("longitude", ColumnType::Float),
    ("depth_m", ColumnType::Float),
    ("volume_filtered_m3", ColumnType::Float),
    ("mesh_um", ColumnType::Integer),
    ("flowmeter_ok", ColumnType::Boolean),
    ("time_start", ColumnType::Timestamp),
    ("time_end", ColumnType::Timestamp),
    ("notes", ColumnType::Text),
];

/// Errors raised while building or combining tables
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Row {row} has {actual} cells, schema has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Row {row}, column `{column}`: value does not fit type {expected}")]
    CellType {
        row: usize,
        column: String,
        expected: ColumnType,
    },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// Logical type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    /// ISO-8601 text; kept as a string, never parsed
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered, uniquely named columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self { columns })
    }

    /// The canonical master schema
    pub fn master() -> Self {
        Self {
            columns: MASTER_COLUMNS
                .iter()
                .map(|(name, kind)| Column::new(*name, *kind))
                .collect(),
        }
    }

    /// Type of a master column, if `name` is one
    pub fn master_type(name: &str) -> Option<ColumnType> {
        MASTER_COLUMNS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, kind)| *kind)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Human-readable differences between this schema and `reference`.
    ///
    /// Empty when the schemas are identical.
    pub fn drift_from(&self, reference: &Schema) -> Vec<String> {
        let mut drift = Vec::new();

        for expected in &reference.columns {
            match self.columns.iter().find(|c| c.name == expected.name) {
                None => drift.push(format!("missing column `{}`", expected.name)),
                Some(actual) if actual.kind != expected.kind => drift.push(format!(
                    "column `{}` is {}, expected {}",
                    actual.name, actual.kind, expected.kind
                )),
                Some(_) => {}
            }
        }
        for actual in &self.columns {
            if reference.index_of(&actual.name).is_none() {
                drift.push(format!("extra column `{}`", actual.name));
            }
        }

        if drift.is_empty() && self.names() != reference.names() {
            drift.push("column order differs".to_string());
        }
        drift
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl Value {
    /// Whether this value may be stored in a column of `kind`
    pub fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Text(_), ColumnType::Text | ColumnType::Timestamp)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Boolean(_), ColumnType::Boolean)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// The `(tow, net)` pair of a row
///
/// Cells are kept as text with `None` for null. Two null `tow` cells with the
/// same `net` collide; a null and an empty string do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    pub tow: Option<String>,
    pub net: Option<String>,
}

impl LogicalKey {
    fn part(value: &Value) -> Option<String> {
        (!value.is_null()).then(|| value.to_string())
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |part: &Option<String>| part.clone().unwrap_or_else(|| "null".to_string());
        write!(f, "(tow={}, net={})", show(&self.tow), show(&self.net))
    }
}

/// Rows sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build a table, checking every row's width and cell types.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let mut table = Self::empty(schema);
        table.rows.reserve(rows.len());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        let index = self.rows.len();
        if row.len() != self.schema.len() {
            return Err(TableError::RowWidth {
                row: index,
                expected: self.schema.len(),
                actual: row.len(),
            });
        }
        for (value, column) in row.iter().zip(self.schema.columns()) {
            if !value.fits(column.kind) {
                return Err(TableError::CellType {
                    row: index,
                    column: column.name.clone(),
                    expected: column.kind,
                });
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append every row of `other`; both tables must share one schema.
    pub fn append(&mut self, other: Table) -> Result<(), TableError> {
        if other.schema != self.schema {
            let drift = other.schema.drift_from(&self.schema);
            return Err(TableError::SchemaMismatch(drift.join("; ")));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.schema.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over one column's cells
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value> + '_> {
        let index = self.schema.index_of(name)?;
        Some(self.rows.iter().map(move |row| &row[index]))
    }

    /// Logical keys occurring more than once, in order of first repetition.
    ///
    /// Returns `None` when the schema lacks `tow` or `net`, because the
    /// uniqueness check cannot be evaluated.
    pub fn duplicate_keys(&self) -> Option<Vec<LogicalKey>> {
        let tow = self.schema.index_of(LOGICAL_KEY[0])?;
        let net = self.schema.index_of(LOGICAL_KEY[1])?;

        let mut counts: HashMap<LogicalKey, usize> = HashMap::new();
        let mut duplicates = Vec::new();
        for row in &self.rows {
            let key = LogicalKey {
                tow: LogicalKey::part(&row[tow]),
                net: LogicalKey::part(&row[net]),
            };
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count == 2 {
                duplicates.push(key);
            }
        }
        Some(duplicates)
    }
}
