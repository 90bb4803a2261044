//! Column SQL types and value compatibility.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// SQL data types a mapped column may declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    Boolean,

    // String types
    VarChar(u32),
    Text,

    Blob,

    // Date/time types
    Date,
    Timestamp,

    Uuid,
    Json,

    Array(Box<SqlType>),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::Array(inner) => format!("{}[]", inner.sql_name()),
        }
    }

    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }

    /// Can a column of this type hold `value`?
    ///
    /// NULL is accepted by every type; nullability is checked separately.
    /// Integer columns accept any integer width so keys survive widening.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SqlType::SmallInt | SqlType::Integer | SqlType::BigInt, v) => v.is_integer(),
            (SqlType::Double, Value::Double(_)) => true,
            (SqlType::Double, v) => v.is_integer(),
            (SqlType::Decimal { .. }, Value::Decimal(_) | Value::Double(_)) => true,
            (SqlType::Decimal { .. }, v) => v.is_integer(),
            (SqlType::Boolean, Value::Bool(_)) => true,
            (SqlType::VarChar(max), Value::Text(s)) => s.chars().count() <= *max as usize,
            (SqlType::Text, Value::Text(_)) => true,
            (SqlType::Blob, Value::Bytes(_)) => true,
            (SqlType::Date, Value::Date(_)) => true,
            (SqlType::Timestamp, Value::Timestamp(_)) => true,
            (SqlType::Uuid, Value::Uuid(_)) => true,
            (SqlType::Json, Value::Json(_)) => true,
            (SqlType::Array(inner), Value::Array(items)) => items.iter().all(|v| inner.accepts(v)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_names() {
        assert_eq!(SqlType::BigInt.sql_name(), "BIGINT");
        assert_eq!(SqlType::VarChar(20).sql_name(), "VARCHAR(20)");
        assert_eq!(
            SqlType::Array(Box::new(SqlType::Integer)).sql_name(),
            "INTEGER[]"
        );
    }

    #[test]
    fn test_accepts() {
        assert!(SqlType::BigInt.accepts(&Value::Int(3)));
        assert!(SqlType::BigInt.accepts(&Value::Null));
        assert!(!SqlType::BigInt.accepts(&Value::Text("3".into())));
        assert!(SqlType::VarChar(3).accepts(&Value::Text("abc".into())));
        assert!(!SqlType::VarChar(3).accepts(&Value::Text("abcd".into())));
        assert!(SqlType::Double.accepts(&Value::BigInt(1)));
        assert!(
            SqlType::Array(Box::new(SqlType::Text))
                .accepts(&Value::Array(vec![Value::Text("a".into())]))
        );
    }
}
