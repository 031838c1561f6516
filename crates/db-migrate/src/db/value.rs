//! Row values carried from source to target.

use serde::{Deserialize, Serialize};

/// One row, in column order.
pub type Row = Vec<SqlValue>;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Decimal(rust_decimal::Decimal),
    DateTime(chrono::NaiveDateTime),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    /// Text array, e.g. from a MySQL SET column.
    Array(Vec<String>),
    /// Geometric point.
    Point { x: f64, y: f64 },
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer value, for keyset cursors and integer coercions.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_i64() {
        assert_eq!(SqlValue::I16(-3).as_i64(), Some(-3));
        assert_eq!(SqlValue::I64(9_000_000_000).as_i64(), Some(9_000_000_000));
        assert_eq!(SqlValue::Text("1".into()).as_i64(), None);
        assert!(SqlValue::Null.is_null());
    }
}
