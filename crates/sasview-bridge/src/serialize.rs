//! Conversion of serialized interpreter results into host-native values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

/// One dataset row: column name to scalar value, in column order.
pub type Record = Map<String, Value>;

/// Row and column counts of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    /// Number of rows
    pub rows: u64,
    /// Number of columns
    pub cols: u64,
}

impl From<DatasetShape> for (u64, u64) {
    fn from(shape: DatasetShape) -> Self {
        (shape.rows, shape.cols)
    }
}

/// Final output of a read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TabularResult {
    /// Selected records
    Records(Vec<Record>),
    /// Dimensions only
    Shape(DatasetShape),
}

/// Expected layout of a serialized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Array of records
    Records,
    /// Array of two integers
    Shape,
}

/// Parse a serialized result of the given kind.
pub fn to_structured(buffer: &[u8], kind: ResultKind) -> Result<TabularResult> {
    match kind {
        ResultKind::Records => to_records(buffer).map(TabularResult::Records),
        ResultKind::Shape => to_shape(buffer).map(TabularResult::Shape),
    }
}

/// Parse an array of records. Values must be JSON scalars; their types are
/// passed through untouched.
pub fn to_records(buffer: &[u8]) -> Result<Vec<Record>> {
    let rows = match parse(buffer)? {
        Value::Array(rows) => rows,
        other => {
            return Err(malformed(format!(
                "expected an array of records, got {}",
                kind_of(&other)
            )))
        }
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(record) => {
                if let Some((col, value)) = record
                    .iter()
                    .find(|(_, v)| matches!(v, Value::Array(_) | Value::Object(_)))
                {
                    return Err(malformed(format!(
                        "record {} column {:?} is not a scalar ({})",
                        i,
                        col,
                        kind_of(value)
                    )));
                }
                Ok(record)
            }
            other => Err(malformed(format!(
                "record {} is {}, not an object",
                i,
                kind_of(&other)
            ))),
        })
        .collect()
}

/// Parse a `[rows, cols]` dimension pair.
pub fn to_shape(buffer: &[u8]) -> Result<DatasetShape> {
    let value = parse(buffer)?;
    let dims = match &value {
        Value::Array(dims) if dims.len() == 2 => dims,
        other => {
            return Err(malformed(format!(
                "expected [rows, cols], got {}",
                other
            )))
        }
    };

    let dim = |v: &Value| {
        v.as_u64()
            .ok_or_else(|| malformed(format!("dimension {} is not a non-negative integer", v)))
    };
    Ok(DatasetShape {
        rows: dim(&dims[0])?,
        cols: dim(&dims[1])?,
    })
}

fn parse(buffer: &[u8]) -> Result<Value> {
    serde_json::from_slice(buffer).map_err(|e| malformed(format!("invalid JSON: {}", e)))
}

fn malformed(msg: String) -> BridgeError {
    tracing::error!("interpreter result violates the serialization contract: {}", msg);
    BridgeError::MalformedResult(msg)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
