//! PostgreSQL literal rendering for bulk inserts.
//!
//! Rows are sent as one multi-row INSERT through the simple query protocol.
//! Untyped string literals let the server coerce into whatever column type
//! the transformer chose (point, boolean, arrays, enums).

use crate::db::SqlValue;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

fn escape_sql_string(s: &str) -> String {
    // PostgreSQL text cannot hold NUL
    s.replace('\'', "''").replace('\0', "")
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "'NaN'::float8".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "'Infinity'::float8" } else { "'-Infinity'::float8" }.to_string()
    } else {
        v.to_string()
    }
}

/// Convert SqlValue to SQL literal string.
pub fn sql_value_to_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        SqlValue::I16(n) => n.to_string(),
        SqlValue::I32(n) => n.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F32(n) => float_literal(f64::from(*n)),
        SqlValue::F64(n) => float_literal(*n),
        SqlValue::Text(s) => format!("'{}'", escape_sql_string(s)),
        SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
        SqlValue::Decimal(d) => format!("{}::numeric", d),
        SqlValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
        SqlValue::Date(d) => format!("'{}'", d),
        SqlValue::Time(t) => format!("'{}'", t),
        SqlValue::Array(items) => {
            if items.is_empty() {
                "'{}'".to_string()
            } else {
                let quoted: Vec<String> = items
                    .iter()
                    .map(|s| format!("'{}'", escape_sql_string(s)))
                    .collect();
                format!("ARRAY[{}]", quoted.join(", "))
            }
        }
        SqlValue::Point { x, y } => format!("'({}, {})'", x, y),
    }
}

/// Build INSERT SQL with literal values (no parameters).
pub fn build_insert_sql(schema: &str, table: &str, cols: &[String], rows: &[Vec<SqlValue>]) -> String {
    let col_list: String = cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let value_rows: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(sql_value_to_literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify(schema, table),
        col_list,
        value_rows.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify("public", "Order"), "\"public\".\"Order\"");
    }

    #[test]
    fn test_literals() {
        assert_eq!(sql_value_to_literal(&SqlValue::Null), "NULL");
        assert_eq!(sql_value_to_literal(&SqlValue::Bool(true)), "TRUE");
        assert_eq!(sql_value_to_literal(&SqlValue::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(sql_value_to_literal(&SqlValue::Bytes(vec![0xde, 0xad])), "'\\xdead'::bytea");
        assert_eq!(sql_value_to_literal(&SqlValue::F64(f64::NAN)), "'NaN'::float8");
        assert_eq!(sql_value_to_literal(&SqlValue::Point { x: 1.5, y: -2.0 }), "'(1.5, -2)'");
        assert_eq!(
            sql_value_to_literal(&SqlValue::Array(vec!["a".into(), "b'c".into()])),
            "ARRAY['a', 'b''c']"
        );
        assert_eq!(sql_value_to_literal(&SqlValue::Array(vec![])), "'{}'");
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(13, 5, 0)
            .unwrap();
        assert_eq!(sql_value_to_literal(&SqlValue::DateTime(dt)), "'2024-02-29 13:05:00.000000'");
    }

    #[test]
    fn test_build_insert_sql() {
        let sql = build_insert_sql(
            "public",
            "users",
            &["id".to_string(), "name".to_string()],
            &[
                vec![SqlValue::I64(1), SqlValue::Text("ann".into())],
                vec![SqlValue::I64(2), SqlValue::Null],
            ],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES (1, 'ann'), (2, NULL)"
        );
    }
}
