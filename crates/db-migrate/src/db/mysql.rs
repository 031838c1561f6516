//! MySQL source reader.
//!
//! Integer single-column keys are paged with keyset pagination; every other
//! table falls back to ORDER BY + OFFSET. Temporal, set, enum and spatial
//! columns are cast server-side so that zero dates and internal geometry
//! survive decoding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Row as _, ValueRef};
use tracing::{debug, info};

use super::{Batch, ConnectionDescriptor, ReadCursor, Row, SourceDatabase, SqlValue};
use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::schema::{Column, TableMeta};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How a column is selected and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decode {
    Signed,
    Unsigned,
    /// `year`, cast to SIGNED server-side.
    Year,
    Float,
    Double,
    Decimal,
    /// `bit(1)`
    Flag,
    /// `bit(n)`, n > 1
    Bits,
    /// Cast to CHAR server-side, parsed client-side.
    Date,
    DateTime,
    Time,
    /// Cast to CHAR server-side, kept as text.
    CastText,
    /// Cast to BINARY server-side.
    CastBinary,
    Binary,
    Text,
}

impl Decode {
    fn for_column(column: &Column) -> Self {
        let data_type = column.data_type.to_lowercase();
        let unsigned = column.column_type.to_lowercase().contains("unsigned");
        match data_type.as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => {
                if unsigned {
                    Decode::Unsigned
                } else {
                    Decode::Signed
                }
            }
            "year" => Decode::Year,
            "float" => Decode::Float,
            "double" | "real" => Decode::Double,
            "decimal" | "numeric" => Decode::Decimal,
            "bit" => {
                let full = column.full_type();
                if full == "bit" || full == "bit(1)" {
                    Decode::Flag
                } else {
                    Decode::Bits
                }
            }
            "date" => Decode::Date,
            "datetime" | "timestamp" => Decode::DateTime,
            "time" => Decode::Time,
            "set" | "enum" | "json" => Decode::CastText,
            "geometry" | "point" | "linestring" | "polygon" | "multipoint"
            | "multilinestring" | "multipolygon" | "geometrycollection" => Decode::CastBinary,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
                Decode::Binary
            }
            _ => Decode::Text,
        }
    }

    /// Select-list expression for the column.
    fn select_expr(&self, name: &str) -> String {
        let ident = quote_ident(name);
        match self {
            Decode::Date | Decode::DateTime | Decode::Time | Decode::CastText => {
                format!("CAST({ident} AS CHAR) AS {ident}")
            }
            Decode::CastBinary => format!("CAST({ident} AS BINARY) AS {ident}"),
            Decode::Year => format!("CAST({ident} AS SIGNED) AS {ident}"),
            _ => ident,
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Parse a temporal value rendered by `CAST(.. AS CHAR)`. Values chrono
/// cannot represent (zero dates, times past 24h) stay text.
fn parse_temporal(decode: Decode, text: String) -> SqlValue {
    let parsed = match decode {
        Decode::Date => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        Decode::DateTime => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(SqlValue::DateTime),
        Decode::Time => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
            .ok()
            .map(SqlValue::Time),
        _ => None,
    };
    parsed.unwrap_or(SqlValue::Text(text))
}

/// MySQL source database.
pub struct MysqlSource {
    pool: MySqlPool,
    database: String,
    descriptor: ConnectionDescriptor,
}

impl MysqlSource {
    pub async fn connect(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let ssl_mode = if config.ssl {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        };

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode);

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "creating MySQL source pool"))?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        let descriptor = ConnectionDescriptor {
            engine: "mysql".into(),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
        };
        info!("Connected to MySQL source {}", descriptor);

        Ok(Self {
            pool,
            database: config.database.clone(),
            descriptor,
        })
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.database), quote_ident(table))
    }

    fn row_to_values(row: &MySqlRow, table: &TableMeta, decoders: &[Decode]) -> Result<Row> {
        let mut values = Vec::with_capacity(decoders.len());
        for (i, decode) in decoders.iter().enumerate() {
            let is_null = row.try_get_raw(i).map(|raw| raw.is_null()).unwrap_or(true);
            if is_null {
                values.push(SqlValue::Null);
                continue;
            }
            let value = Self::decode_value(row, i, *decode).map_err(|e| {
                MigrateError::transfer(
                    &table.name,
                    format!("decoding column {}: {}", table.columns[i].name, e),
                )
            })?;
            values.push(value);
        }
        Ok(values)
    }

    fn decode_value(row: &MySqlRow, i: usize, decode: Decode) -> std::result::Result<SqlValue, sqlx::Error> {
        Ok(match decode {
            Decode::Signed | Decode::Year => SqlValue::I64(row.try_get::<i64, _>(i)?),
            Decode::Unsigned => {
                let v = row.try_get::<u64, _>(i)?;
                match i64::try_from(v) {
                    Ok(v) => SqlValue::I64(v),
                    Err(_) => SqlValue::Decimal(rust_decimal::Decimal::from(v)),
                }
            }
            Decode::Float => SqlValue::F32(row.try_get::<f32, _>(i)?),
            Decode::Double => SqlValue::F64(row.try_get::<f64, _>(i)?),
            Decode::Decimal => SqlValue::Decimal(row.try_get::<rust_decimal::Decimal, _>(i)?),
            Decode::Flag => match row.try_get::<bool, _>(i) {
                Ok(b) => SqlValue::Bool(b),
                Err(_) => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?),
            },
            Decode::Bits => match row.try_get::<u64, _>(i) {
                Ok(v) => SqlValue::I64(v as i64),
                Err(_) => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?),
            },
            Decode::Date | Decode::DateTime | Decode::Time => {
                parse_temporal(decode, row.try_get::<String, _>(i)?)
            }
            Decode::CastBinary | Decode::Binary => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?),
            Decode::CastText | Decode::Text => match row.try_get::<String, _>(i) {
                Ok(s) => SqlValue::Text(s),
                Err(_) => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?),
            },
        })
    }
}

/// SELECT for one page, and whether it pages by key.
fn page_query(
    table_ref: &str,
    table: &TableMeta,
    decoders: &[Decode],
    cursor: &ReadCursor,
    limit: usize,
) -> Result<(String, bool)> {
    let select_list = table
        .columns
        .iter()
        .zip(decoders)
        .map(|(c, d)| d.select_expr(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {} FROM {}", select_list, table_ref);

    if let Some(pk) = table.integer_pk() {
        let key = quote_ident(&pk.name);
        match cursor {
            ReadCursor::Start => {}
            ReadCursor::AfterKey(last) => sql.push_str(&format!(" WHERE {} > {}", key, last)),
            ReadCursor::Offset(_) => {
                return Err(MigrateError::transfer(
                    &table.name,
                    "offset cursor on a keyset-paged table",
                ))
            }
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", key, limit));
        return Ok((sql, true));
    }

    let offset = match cursor {
        ReadCursor::Start => 0,
        ReadCursor::Offset(offset) => *offset,
        ReadCursor::AfterKey(_) => {
            return Err(MigrateError::transfer(
                &table.name,
                "key cursor on a table without an integer primary key",
            ))
        }
    };
    let order_by = if table.primary_key.is_empty() {
        (1..=table.columns.len())
            .map(|pos| pos.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        table
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    sql.push_str(&format!(" ORDER BY {} LIMIT {} OFFSET {}", order_by, limit, offset));
    Ok((sql, false))
}

#[async_trait]
impl SourceDatabase for MysqlSource {
    async fn row_count(&self, table: &TableMeta) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", self.table_ref(&table.name));
        let row: MySqlRow = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("cnt")?)
    }

    async fn fetch_batch(&self, table: &TableMeta, cursor: &ReadCursor, limit: usize) -> Result<Batch> {
        let decoders: Vec<Decode> = table.columns.iter().map(Decode::for_column).collect();
        let (sql, keyset) = page_query(&self.table_ref(&table.name), table, &decoders, cursor, limit)?;
        debug!("{}: {}", table.name, sql);

        let fetched: Vec<MySqlRow> = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let rows = fetched
            .iter()
            .map(|row| Self::row_to_values(row, table, &decoders))
            .collect::<Result<Vec<Row>>>()?;

        if rows.len() < limit {
            return Ok(Batch { rows, next: None });
        }

        let next = if keyset {
            let key_index = table
                .integer_pk()
                .and_then(|pk| table.columns.iter().position(|c| c.name == pk.name));
            let last = key_index
                .and_then(|idx| rows.last().and_then(|row| row.get(idx)))
                .and_then(SqlValue::as_i64)
                .ok_or_else(|| MigrateError::transfer(&table.name, "primary key value is not an integer"))?;
            ReadCursor::AfterKey(last)
        } else {
            let offset = match cursor {
                ReadCursor::Offset(offset) => *offset,
                _ => 0,
            };
            ReadCursor::Offset(offset + rows.len() as u64)
        };
        Ok(Batch { rows, next: Some(next) })
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.clone()
    }
}
