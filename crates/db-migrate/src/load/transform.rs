//! Per-column value coercion from MySQL encodings to PostgreSQL ones.

use crate::db::{Row, SqlValue};
use crate::schema::{Column, TableMeta};

/// Coercion applied to every value of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnTransform {
    Identity,
    /// `tinyint(1)` and `bit(1)` hold booleans.
    Boolean,
    /// `0000-00-00` dates have no PostgreSQL equivalent.
    ZeroDateToNull,
    /// `SET` values arrive comma separated.
    SetToArray,
    /// Internal geometry: 4-byte SRID followed by a WKB point.
    WkbPoint,
    /// Multi-byte `bit(n)` as a big-endian integer.
    BitToInteger,
}

impl ColumnTransform {
    pub fn for_column(column: &Column) -> Self {
        let data_type = column.data_type.to_lowercase();
        let full_type = column.full_type();
        match data_type.as_str() {
            "tinyint" if full_type.starts_with("tinyint(1)") => ColumnTransform::Boolean,
            "bit" if full_type == "bit" || full_type == "bit(1)" => ColumnTransform::Boolean,
            "bit" => ColumnTransform::BitToInteger,
            "date" | "datetime" | "timestamp" => ColumnTransform::ZeroDateToNull,
            "set" => ColumnTransform::SetToArray,
            "geometry" | "point" => ColumnTransform::WkbPoint,
            _ => ColumnTransform::Identity,
        }
    }

    pub fn apply(&self, value: SqlValue) -> SqlValue {
        if value.is_null() {
            return value;
        }
        match self {
            ColumnTransform::Identity => value,
            ColumnTransform::Boolean => match value {
                SqlValue::Bool(b) => SqlValue::Bool(b),
                SqlValue::Bytes(b) => SqlValue::Bool(b.iter().any(|x| *x != 0)),
                SqlValue::Text(s) => SqlValue::Bool(s == "1" || s.eq_ignore_ascii_case("true")),
                other => match other.as_i64() {
                    Some(n) => SqlValue::Bool(n != 0),
                    None => other,
                },
            },
            ColumnTransform::ZeroDateToNull => {
                if matches!(&value, SqlValue::Text(s) if s.starts_with("0000-00-00")) {
                    SqlValue::Null
                } else {
                    value
                }
            }
            ColumnTransform::SetToArray => match value {
                SqlValue::Text(s) if s.is_empty() => SqlValue::Array(Vec::new()),
                SqlValue::Text(s) => SqlValue::Array(s.split(',').map(String::from).collect()),
                other => other,
            },
            ColumnTransform::WkbPoint => match value {
                SqlValue::Bytes(b) => match parse_point(&b) {
                    Some((x, y)) => SqlValue::Point { x, y },
                    None => SqlValue::Null,
                },
                other => other,
            },
            ColumnTransform::BitToInteger => match value {
                SqlValue::Bytes(b) if b.len() <= 8 => {
                    SqlValue::I64(b.iter().fold(0i64, |acc, byte| (acc << 8) | i64::from(*byte)))
                }
                other => other,
            },
        }
    }
}

/// Read x and y from `SRID(4) | byte order(1) | type(4) | x(8) | y(8)`.
fn parse_point(bytes: &[u8]) -> Option<(f64, f64)> {
    if bytes.len() < 25 {
        return None;
    }
    let little_endian = match bytes[4] {
        1 => true,
        0 => false,
        _ => return None,
    };
    let read_u32 = |b: &[u8]| -> Option<u32> {
        let arr: [u8; 4] = b.try_into().ok()?;
        Some(if little_endian { u32::from_le_bytes(arr) } else { u32::from_be_bytes(arr) })
    };
    let read_f64 = |b: &[u8]| -> Option<f64> {
        let arr: [u8; 8] = b.try_into().ok()?;
        Some(if little_endian { f64::from_le_bytes(arr) } else { f64::from_be_bytes(arr) })
    };
    // WKB type 1 is Point
    if read_u32(&bytes[5..9])? != 1 {
        return None;
    }
    Some((read_f64(&bytes[9..17])?, read_f64(&bytes[17..25])?))
}

/// Transforms for every column of a table, in column order.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    transforms: Vec<ColumnTransform>,
}

impl RowTransformer {
    pub fn for_table(table: &TableMeta) -> Self {
        Self {
            transforms: table.columns.iter().map(ColumnTransform::for_column).collect(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.transforms.iter().all(|t| *t == ColumnTransform::Identity)
    }

    pub fn apply(&self, row: Row) -> Row {
        if self.is_identity() {
            return row;
        }
        row.into_iter()
            .enumerate()
            .map(|(i, value)| match self.transforms.get(i) {
                Some(transform) => transform.apply(value),
                None => value,
            })
            .collect()
    }
}
