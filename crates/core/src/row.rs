//! Rows and table metadata.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{RowError, RowResult};
use crate::key::{KeyColumn, PrimaryKey};

/// Sort direction of an ordering column.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// One column of an ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: Cow<'static, str>,
    #[serde(default)]
    pub direction: Direction,
}

impl OrderBy {
    pub const fn asc(column: &'static str) -> Self {
        Self {
            column: Cow::Borrowed(column),
            direction: Direction::Asc,
        }
    }

    pub const fn desc(column: &'static str) -> Self {
        Self {
            column: Cow::Borrowed(column),
            direction: Direction::Desc,
        }
    }

    pub fn owned(column: impl Into<String>, direction: Direction) -> Self {
        Self {
            column: Cow::Owned(column.into()),
            direction,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }
}

/// Name and primary key layout of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: Cow<'static, str>,
    pub primary_key: Cow<'static, [KeyColumn]>,
}

impl TableSchema {
    pub const fn new(name: &'static str, primary_key: &'static [KeyColumn]) -> Self {
        Self {
            name: Cow::Borrowed(name),
            primary_key: Cow::Borrowed(primary_key),
        }
    }

    pub fn owned(name: impl Into<String>, primary_key: Vec<KeyColumn>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            primary_key: Cow::Owned(primary_key),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &[KeyColumn] {
        &self.primary_key
    }

    /// Ordering over the primary key columns, ascending.
    pub fn key_order(&self) -> Vec<OrderBy> {
        self.primary_key
            .iter()
            .map(|c| OrderBy::owned(c.name(), Direction::Asc))
            .collect()
    }

    /// Turn a JSON object into a row of this table.
    pub fn row_from_json(&self, value: JsonValue) -> RowResult<Row> {
        match value {
            JsonValue::Object(fields) => {
                let pk = PrimaryKey::from_fields(self.primary_key(), &fields)?;
                Ok(Row { pk, fields })
            }
            other => Err(RowError::NotAnObject(other.to_string())),
        }
    }
}

/// A stored row: its primary key plus every column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pk: PrimaryKey,
    fields: Map<String, JsonValue>,
}

impl Row {
    pub fn pk(&self) -> &PrimaryKey {
        &self.pk
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.fields.get(column)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.fields)
    }

    /// Compare two rows by an ordering key, falling back to primary key order.
    ///
    /// NULLs sort after every other value in ascending order (and first in
    /// descending order), matching PostgreSQL's default.
    pub fn compare_by(&self, other: &Row, order_by: &[OrderBy]) -> Ordering {
        for key in order_by {
            let ord = compare_json(self.get(key.column()), other.get(key.column()));
            let ord = match key.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.pk.cmp(&other.pk)
    }
}

fn type_rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Bool(_) => 0,
        JsonValue::Number(_) => 1,
        JsonValue::String(_) => 2,
        JsonValue::Array(_) => 3,
        JsonValue::Object(_) => 4,
        JsonValue::Null => 5,
    }
}

fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    let a = a.unwrap_or(&JsonValue::Null);
    let b = b.unwrap_or(&JsonValue::Null);
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
