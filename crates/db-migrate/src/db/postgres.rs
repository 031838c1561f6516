//! PostgreSQL target.
//!
//! Plain statements go through a deadpool-postgres pool. Clears and bulk
//! inserts go through one pinned load session so that
//! `session_replication_role` set by `suspend_integrity` applies to them.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::{SslMode, TlsBuilder};
use super::{ConnectionDescriptor, Row, TargetDatabase, TargetRole};
use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::schema::{ForeignKeyRef, ObjectKind};
use crate::sql::{build_insert_sql, qualify, quote_ident};

/// Connection establishment bound.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A PostgreSQL database acting as verification or production target.
pub struct PgTarget {
    role: TargetRole,
    pool: Pool,
    schema: String,
    descriptor: ConnectionDescriptor,
    session: Mutex<Option<Object>>,
}

impl PgTarget {
    /// Connect and check the connection with `SELECT 1`.
    ///
    /// `statement_timeout` is also set server-side so a statement abandoned
    /// by the client-side bound does not keep running.
    pub async fn connect(
        config: &TargetConfig,
        role: TargetRole,
        max_conns: usize,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.ssl_mode(ssl_mode.handshake_mode());
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);
        pg_config.application_name("db-migrate");
        pg_config.options(&format!(
            "-c statement_timeout={} -c search_path={}",
            statement_timeout.as_millis(),
            config.schema
        ));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let context = format!("creating PostgreSQL {} pool", role);
        let pool = match TlsBuilder::new(ssl_mode).build()? {
            None => {
                warn!("{} target TLS is disabled; credentials are sent in plaintext", role);
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool(e.to_string(), context.as_str()))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool(e.to_string(), context.as_str()))?
            }
        };

        let target = Self {
            role,
            pool,
            schema: config.schema.clone(),
            descriptor: ConnectionDescriptor {
                engine: "postgres".into(),
                host: config.host.clone(),
                port: config.port,
                database: config.database.clone(),
            },
            session: Mutex::new(None),
        };

        let client = target.client().await?;
        client.simple_query("SELECT 1").await?;
        info!("Connected to {} target {}", role, target.descriptor);

        Ok(target)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| {
            MigrateError::pool(e.to_string(), format!("getting {} target connection", self.role))
        })
    }

    /// The pinned load session, opened on first use.
    async fn session(&self) -> Result<MutexGuard<'_, Option<Object>>> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.client().await?);
        }
        Ok(session)
    }

    async fn on_session(&self, sql: &str) -> Result<()> {
        let session = self.session().await?;
        let client = session.as_ref().ok_or_else(|| {
            MigrateError::pool("load session missing", format!("{} target", self.role))
        })?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn names(&self, sql: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client.query(sql, &[&self.schema]).await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

/// Existence query for one object kind; `$1` schema, `$2` name, `$3` lowercased name.
fn existence_query(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Table => {
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables
             WHERE table_schema::text = $1 AND table_type = 'BASE TABLE'
               AND table_name::text IN ($2, $3))"
        }
        ObjectKind::View => {
            "SELECT EXISTS (SELECT 1 FROM information_schema.views
             WHERE table_schema::text = $1 AND table_name::text IN ($2, $3))"
        }
        ObjectKind::Index => {
            "SELECT EXISTS (SELECT 1 FROM pg_indexes
             WHERE schemaname = $1 AND indexname IN ($2, $3))"
        }
        ObjectKind::Constraint => {
            "SELECT EXISTS (SELECT 1 FROM pg_constraint c
             JOIN pg_namespace n ON n.oid = c.connamespace
             WHERE n.nspname = $1 AND c.conname IN ($2, $3))"
        }
        ObjectKind::Trigger => {
            "SELECT EXISTS (SELECT 1 FROM pg_trigger t
             JOIN pg_class c ON c.oid = t.tgrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND NOT t.tgisinternal AND t.tgname IN ($2, $3))"
        }
        ObjectKind::Routine => {
            "SELECT EXISTS (SELECT 1 FROM pg_proc p
             JOIN pg_namespace n ON n.oid = p.pronamespace
             WHERE n.nspname = $1 AND p.proname IN ($2, $3))"
        }
    }
}

/// Count child rows with a fully non-null key that matches no parent row,
/// the rows `MATCH SIMPLE` would have rejected.
fn orphan_count_sql(schema: &str, table: &str, fk: &ForeignKeyRef) -> String {
    let not_null: Vec<String> = fk
        .columns
        .iter()
        .map(|c| format!("c.{} IS NOT NULL", quote_ident(c)))
        .collect();
    let joined: Vec<String> = fk
        .columns
        .iter()
        .zip(&fk.ref_columns)
        .map(|(c, r)| format!("p.{} = c.{}", quote_ident(r), quote_ident(c)))
        .collect();
    format!(
        "SELECT COUNT(*)::int8 FROM {} c WHERE {} AND NOT EXISTS (SELECT 1 FROM {} p WHERE {})",
        qualify(schema, table),
        not_null.join(" AND "),
        qualify(schema, &fk.ref_table),
        joined.join(" AND ")
    )
}

/// Objects removed by `reset`, in drop order, as `(label, listing query)`.
const RESET_LISTINGS: [(&str, &str); 5] = [
    (
        "VIEW",
        "SELECT table_name::text FROM information_schema.views WHERE table_schema::text = $1",
    ),
    (
        "TABLE",
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema::text = $1 AND table_type = 'BASE TABLE'",
    ),
    (
        "SEQUENCE",
        "SELECT sequence_name::text FROM information_schema.sequences WHERE sequence_schema::text = $1",
    ),
    (
        "ROUTINE",
        "SELECT p.oid::regprocedure::text FROM pg_proc p
         JOIN pg_namespace n ON n.oid = p.pronamespace
         WHERE n.nspname = $1 AND p.prokind IN ('f', 'p')
           AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = p.oid AND d.deptype = 'e')",
    ),
    (
        "TYPE",
        "SELECT t.typname::text FROM pg_type t
         JOIN pg_namespace n ON n.oid = t.typnamespace
         WHERE n.nspname = $1 AND t.typtype = 'e'",
    ),
];

#[async_trait]
impl TargetDatabase for PgTarget {
    fn role(&self) -> TargetRole {
        self.role
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn object_exists(&self, name: &str, kind: ObjectKind) -> Result<bool> {
        let client = self.client().await?;
        let lower = name.to_lowercase();
        let row = client
            .query_one(existence_query(kind), &[&self.schema, &name, &lower])
            .await?;
        Ok(row.get::<_, bool>(0))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*)::int8 FROM {}", qualify(&self.schema, table));
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn orphan_rows(&self, table: &str, foreign_key: &ForeignKeyRef) -> Result<i64> {
        if !foreign_key.is_checkable() {
            return Err(MigrateError::Config(format!(
                "foreign key {} has no column pairs to check",
                foreign_key.label(table)
            )));
        }
        let client = self.client().await?;
        let row = client
            .query_one(&orphan_count_sql(&self.schema, table, foreign_key), &[])
            .await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn clear_table(&self, table: &str) -> Result<()> {
        // DELETE rather than TRUNCATE: TRUNCATE ignores session_replication_role
        // and refuses tables referenced by foreign keys.
        self.on_session(&format!("DELETE FROM {}", qualify(&self.schema, table)))
            .await?;
        debug!("Cleared {}.{} on {} target", self.schema, table, self.role);
        Ok(())
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = build_insert_sql(&self.schema, table, columns, rows);
        self.on_session(&sql).await?;
        Ok(rows.len() as u64)
    }

    async fn suspend_integrity(&self) -> Result<()> {
        self.on_session("SET session_replication_role = 'replica'")
            .await?;
        info!("Referential integrity suspended on {} target", self.role);
        Ok(())
    }

    async fn restore_integrity(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(client) = session.take() else {
            return Ok(());
        };
        match client.batch_execute("SET session_replication_role = 'origin'").await {
            Ok(()) => {
                info!("Referential integrity restored on {} target", self.role);
                Ok(())
            }
            Err(e) => {
                // Never hand a replica-mode connection back to the pool
                drop(Object::take(client));
                Err(e.into())
            }
        }
    }

    async fn reset_sequence(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let client = self.client().await?;
        let qualified = qualify(&self.schema, table);
        let row = client
            .query_one("SELECT pg_get_serial_sequence($1, $2)", &[&qualified, &column])
            .await?;
        let Some(sequence) = row.get::<_, Option<String>>(0) else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT setval($1::text::regclass, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
            quote_ident(column),
            qualified
        );
        let row = client.query_one(&sql, &[&sequence]).await?;
        let next: i64 = row.get(0);
        debug!("Sequence {} set to {}", sequence, next);
        Ok(Some(next))
    }

    async fn reset(&self) -> Result<usize> {
        if self.role == TargetRole::Production {
            return Err(MigrateError::Config(
                "refusing to reset the production target".into(),
            ));
        }

        let mut dropped = 0;
        for (label, listing) in RESET_LISTINGS {
            for name in self.names(listing).await? {
                let sql = match label {
                    // regprocedure text carries the argument list and quoting
                    "ROUTINE" => format!("DROP ROUTINE IF EXISTS {} CASCADE", name),
                    _ => format!(
                        "DROP {} IF EXISTS {} CASCADE",
                        label,
                        qualify(&self.schema, &name)
                    ),
                };
                self.execute(&sql).await?;
                dropped += 1;
            }
        }
        info!(
            "Reset {} target schema {}: {} objects dropped",
            self.role, self.schema, dropped
        );
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existence_queries_cover_every_kind() {
        for kind in ObjectKind::TIERS {
            let sql = existence_query(kind);
            assert!(sql.contains("$1") && sql.contains("$2") && sql.contains("$3"), "{kind}");
        }
        assert!(existence_query(ObjectKind::Trigger).contains("NOT t.tgisinternal"));
        assert!(existence_query(ObjectKind::Table).contains("BASE TABLE"));
    }

    #[test]
    fn test_orphan_count_sql_pairs_columns() {
        let fk = ForeignKeyRef {
            name: "fk_lines_order".into(),
            columns: vec!["order_id".into(), "shop_id".into()],
            ref_table: "orders".into(),
            ref_columns: vec!["id".into(), "shop_id".into()],
        };
        assert_eq!(
            orphan_count_sql("public", "lines", &fk),
            "SELECT COUNT(*)::int8 FROM \"public\".\"lines\" c \
             WHERE c.\"order_id\" IS NOT NULL AND c.\"shop_id\" IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM \"public\".\"orders\" p \
             WHERE p.\"id\" = c.\"order_id\" AND p.\"shop_id\" = c.\"shop_id\")"
        );
    }

    #[test]
    fn test_reset_drops_views_before_tables() {
        let labels: Vec<&str> = RESET_LISTINGS.iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["VIEW", "TABLE", "SEQUENCE", "ROUTINE", "TYPE"]);
    }
}
