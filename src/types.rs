//! Row and column data carried between the server and the client.
//!
//! These types appear both on the wire (inline row batches, staged files) and in the
//! client-facing result API, so they derive the bincode codec traits directly.
use std::fmt;

use bincode::{Decode, Encode};

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Binary(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// One result row, in column order.
pub type Row = Vec<Value>;

/// A contiguous run of rows delivered as a unit.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct RowBatch {
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Logical type of a result column as declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum LogicalType {
    Boolean,
    Int,
    BigInt,
    Double,
    String,
    Binary,
    Date,
    Timestamp,
    Decimal { precision: u8, scale: u8 },
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Boolean => write!(f, "boolean"),
            LogicalType::Int => write!(f, "int"),
            LogicalType::BigInt => write!(f, "bigint"),
            LogicalType::Double => write!(f, "double"),
            LogicalType::String => write!(f, "string"),
            LogicalType::Binary => write!(f, "binary"),
            LogicalType::Date => write!(f, "date"),
            LogicalType::Timestamp => write!(f, "timestamp"),
            LogicalType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ColumnDescriptor {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, logical_type: LogicalType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable,
        }
    }
}

/// A bound statement parameter. Rendering and type inference happen before this crate sees
/// it; the value travels to the server untouched.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Parameter {
    pub name: Option<String>,
    pub value: Value,
}

impl Parameter {
    pub fn positional(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }
}
