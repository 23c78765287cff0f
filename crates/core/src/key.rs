//! Primary keys of stored rows.
//!
//! A signal table may use a single-column or a composite primary key. Keys are
//! modelled as an ordered tuple of [`KeyValue`]s so they can be used directly as
//! `HashSet`/`BTreeMap` keys (snapshots, lock tables, dedup checks).

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{RowError, RowResult};

/// SQL type family of a primary key column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Any integer column (`smallint`, `integer`, `bigint`).
    Int,
    /// Any character column (`text`, `varchar`).
    Text,
    /// A `uuid` column.
    Uuid,
}

/// A primary key column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: Cow<'static, str>,
    pub kind: KeyKind,
}

impl KeyColumn {
    pub const fn int(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: KeyKind::Int,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: KeyKind::Text,
        }
    }

    pub const fn uuid(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: KeyKind::Uuid,
        }
    }

    pub fn owned(name: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extract this column's key value from a JSON field.
    pub fn value_from_json(&self, value: &JsonValue) -> RowResult<KeyValue> {
        match self.kind {
            KeyKind::Int => value
                .as_i64()
                .map(KeyValue::Int)
                .ok_or_else(|| RowError::invalid_key(self.name(), format!("expected integer, got {value}"))),
            KeyKind::Text => value
                .as_str()
                .map(|s| KeyValue::Text(s.to_string()))
                .ok_or_else(|| RowError::invalid_key(self.name(), format!("expected string, got {value}"))),
            KeyKind::Uuid => {
                let s = value
                    .as_str()
                    .ok_or_else(|| RowError::invalid_key(self.name(), format!("expected uuid string, got {value}")))?;
                Uuid::parse_str(s)
                    .map(KeyValue::Uuid)
                    .map_err(|e| RowError::invalid_key(self.name(), e.to_string()))
            }
        }
    }
}

/// One component of a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl KeyValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Int(_) => KeyKind::Int,
            KeyValue::Text(_) => KeyKind::Text,
            KeyValue::Uuid(_) => KeyKind::Uuid,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            KeyValue::Int(v) => JsonValue::from(*v),
            KeyValue::Text(v) => JsonValue::from(v.as_str()),
            KeyValue::Uuid(v) => JsonValue::from(v.to_string()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => write!(f, "'{v}'"),
            KeyValue::Uuid(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

/// Primary key of a row (possibly composite).
///
/// Equality, hashing and ordering are component-wise, in key column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PrimaryKey(Vec<KeyValue>);

impl PrimaryKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<KeyValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a key from the named columns of a JSON object.
    pub fn from_fields(
        columns: &[KeyColumn],
        fields: &serde_json::Map<String, JsonValue>,
    ) -> RowResult<Self> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let value = fields
                .get(column.name())
                .ok_or_else(|| RowError::MissingKeyColumn(column.name().to_string()))?;
            values.push(column.value_from_json(value)?);
        }
        Ok(Self(values))
    }

    /// Check that this key matches the declared key columns.
    pub fn check_against(&self, columns: &[KeyColumn]) -> RowResult<()> {
        if self.0.len() != columns.len() {
            return Err(RowError::KeyArity {
                expected: columns.len(),
                actual: self.0.len(),
            });
        }
        for (value, column) in self.0.iter().zip(columns) {
            if value.kind() != column.kind {
                return Err(RowError::invalid_key(
                    column.name(),
                    format!("expected {:?}, got {:?}", column.kind, value.kind()),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{single}");
        }
        write!(f, "(")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

impl From<KeyValue> for PrimaryKey {
    fn from(value: KeyValue) -> Self {
        Self(vec![value])
    }
}
