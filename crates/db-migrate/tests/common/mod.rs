//! In-memory source and target databases plus a small shop schema.

#![allow(dead_code)]

use async_trait::async_trait;
use db_migrate::{
    Batch, Column, Config, ConnectionDescriptor, ForeignKeyRef, MigrateError, ObjectKind,
    ReadCursor, Result, Row, SchemaDescription, SchemaObject, SourceDatabase, SqlValue, TableMeta, TargetDatabase,
    TargetRole,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Source serving fixed rows, paged the way the MySQL source pages.
pub struct MemorySource {
    tables: BTreeMap<String, Vec<Row>>,
    fetches: Mutex<Vec<(String, usize)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    /// `(table, rows returned)` for every fetch.
    pub fn fetches(&self) -> Vec<(String, usize)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    async fn row_count(&self, table: &TableMeta) -> Result<i64> {
        Ok(self.tables.get(&table.name).map(|r| r.len() as i64).unwrap_or(0))
    }

    async fn fetch_batch(&self, table: &TableMeta, cursor: &ReadCursor, limit: usize) -> Result<Batch> {
        let all = self.tables.get(&table.name).cloned().unwrap_or_default();
        let key_index = table
            .integer_pk()
            .and_then(|pk| table.columns.iter().position(|c| c.name == pk.name));

        let (rows, next): (Vec<Row>, Option<ReadCursor>) = match (key_index, cursor) {
            (Some(idx), _) => {
                let after = match cursor {
                    ReadCursor::AfterKey(k) => *k,
                    _ => i64::MIN,
                };
                let mut sorted: Vec<Row> = all
                    .into_iter()
                    .filter(|r| r[idx].as_i64().map(|v| v > after).unwrap_or(false))
                    .collect();
                sorted.sort_by_key(|r| r[idx].as_i64());
                sorted.truncate(limit);
                let next = (sorted.len() == limit)
                    .then(|| sorted.last().and_then(|r| r[idx].as_i64()))
                    .flatten()
                    .map(ReadCursor::AfterKey);
                (sorted, next)
            }
            (None, _) => {
                let offset = match cursor {
                    ReadCursor::Offset(o) => *o as usize,
                    _ => 0,
                };
                let page: Vec<Row> = all.into_iter().skip(offset).take(limit).collect();
                let next = (page.len() == limit).then(|| ReadCursor::Offset((offset + limit) as u64));
                (page, next)
            }
        };

        self.fetches
            .lock()
            .unwrap()
            .push((table.name.clone(), rows.len()));
        Ok(Batch { rows, next })
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            engine: "memory".into(),
            host: "localhost".into(),
            port: 0,
            database: "shop".into(),
        }
    }
}

#[derive(Default)]
struct TargetData {
    statements: Vec<String>,
    tables: HashMap<String, (Vec<String>, Vec<Row>)>,
    inserts: Vec<(String, usize)>,
    sequences: HashMap<String, i64>,
    suspended: usize,
    restored: usize,
}

/// Target keeping every successful statement and all loaded rows in memory.
///
/// A statement fails when it contains one of the configured needles. An
/// object exists when a successful statement created it.
pub struct MemoryTarget {
    role: TargetRole,
    fail_on: Vec<(String, String)>,
    fail_insert: Option<(String, usize)>,
    reset_delay: Option<Duration>,
    data: Mutex<TargetData>,
}

impl MemoryTarget {
    pub fn new(role: TargetRole) -> Self {
        Self {
            role,
            fail_on: Vec::new(),
            fail_insert: None,
            reset_delay: None,
            data: Mutex::new(TargetData::default()),
        }
    }

    pub fn failing_on(mut self, needle: &str, message: &str) -> Self {
        self.fail_on.push((needle.to_string(), message.to_string()));
        self
    }

    /// Fail the `batch`-th (1-based) insert into `table`.
    pub fn failing_insert(mut self, table: &str, batch: usize) -> Self {
        self.fail_insert = Some((table.to_string(), batch));
        self
    }

    /// Make `reset` hang for `delay` before doing anything.
    pub fn slow_reset(mut self, delay: Duration) -> Self {
        self.reset_delay = Some(delay);
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.data.lock().unwrap().statements.clone()
    }

    /// Rows per bulk insert into `table`.
    pub fn insert_sizes(&self, table: &str) -> Vec<usize> {
        self.data
            .lock()
            .unwrap()
            .inserts
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn rows(&self, table: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|(_, rows)| rows.len())
            .unwrap_or(0)
    }

    /// Next value the sequence behind `table`'s key would hand out.
    pub fn next_sequence_value(&self, table: &str) -> Option<i64> {
        self.data.lock().unwrap().sequences.get(table).copied()
    }

    pub fn integrity_toggles(&self) -> (usize, usize) {
        let data = self.data.lock().unwrap();
        (data.suspended, data.restored)
    }

    /// Remove rows behind the migrator's back.
    pub fn delete_rows(&self, table: &str, count: usize) {
        let mut data = self.data.lock().unwrap();
        if let Some((_, rows)) = data.tables.get_mut(table) {
            let keep = rows.len().saturating_sub(count);
            rows.truncate(keep);
        }
    }

    fn missing(table: &str) -> MigrateError {
        MigrateError::Statement(format!("relation \"{}\" does not exist", table))
    }

    fn created(data: &TargetData, name: &str, kind: ObjectKind) -> bool {
        let pattern = match kind {
            ObjectKind::Table => format!("CREATE TABLE {} ", name),
            ObjectKind::Index => format!("INDEX {} ", name),
            ObjectKind::Constraint => format!("CONSTRAINT {} ", name),
            ObjectKind::View => format!("VIEW {} ", name),
            ObjectKind::Trigger => format!("TRIGGER {} ", name),
            ObjectKind::Routine => format!("FUNCTION {}(", name),
        };
        data.statements.iter().any(|s| s.contains(&pattern))
    }
}

#[async_trait]
impl TargetDatabase for MemoryTarget {
    fn role(&self) -> TargetRole {
        self.role
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            engine: "memory".into(),
            host: "localhost".into(),
            port: 0,
            database: self.role.to_string(),
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        if let Some((_, message)) = self.fail_on.iter().find(|(needle, _)| sql.contains(needle)) {
            return Err(MigrateError::Statement(message.clone()));
        }
        let mut data = self.data.lock().unwrap();
        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let name = rest.split_whitespace().next().unwrap_or_default().to_string();
            if data.tables.contains_key(&name) {
                return Err(MigrateError::Statement(format!(
                    "relation \"{}\" already exists",
                    name
                )));
            }
            data.tables.insert(name, (Vec::new(), Vec::new()));
        }
        data.statements.push(sql.to_string());
        Ok(())
    }

    async fn object_exists(&self, name: &str, kind: ObjectKind) -> Result<bool> {
        let data = self.data.lock().unwrap();
        Ok(Self::created(&data, name, kind))
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let data = self.data.lock().unwrap();
        match data.tables.get(table) {
            Some((_, rows)) => Ok(rows.len() as i64),
            None => Err(MigrateError::Statement(format!(
                "relation \"{}\" does not exist",
                table
            ))),
        }
    }

    async fn orphan_rows(&self, table: &str, foreign_key: &ForeignKeyRef) -> Result<i64> {
        let data = self.data.lock().unwrap();
        let (child_cols, child_rows) = data.tables.get(table).ok_or_else(|| Self::missing(table))?;
        let (parent_cols, parent_rows) = data
            .tables
            .get(&foreign_key.ref_table)
            .ok_or_else(|| Self::missing(&foreign_key.ref_table))?;
        if child_rows.is_empty() {
            return Ok(0);
        }

        let positions = |cols: &[String], names: &[String]| -> Result<Vec<usize>> {
            names
                .iter()
                .map(|n| {
                    cols.iter().position(|c| c == n).ok_or_else(|| {
                        MigrateError::Statement(format!("column \"{}\" does not exist", n))
                    })
                })
                .collect()
        };
        let child_idx = positions(child_cols, &foreign_key.columns)?;
        let parent_keys: Vec<Row> = if parent_rows.is_empty() {
            Vec::new()
        } else {
            let parent_idx = positions(parent_cols, &foreign_key.ref_columns)?;
            parent_rows
                .iter()
                .map(|r| parent_idx.iter().map(|&i| r[i].clone()).collect())
                .collect()
        };

        let orphans = child_rows
            .iter()
            .map(|r| child_idx.iter().map(|&i| r[i].clone()).collect::<Row>())
            .filter(|key| key.iter().all(|v| !v.is_null()) && !parent_keys.contains(key))
            .count();
        Ok(orphans as i64)
    }

    async fn clear_table(&self, table: &str) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        match data.tables.get_mut(table) {
            Some((_, rows)) => {
                rows.clear();
                Ok(())
            }
            None => Err(MigrateError::Statement(format!(
                "relation \"{}\" does not exist",
                table
            ))),
        }
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        let mut data = self.data.lock().unwrap();
        let batch = data.inserts.iter().filter(|(t, _)| t == table).count() + 1;
        if let Some((fail_table, fail_batch)) = &self.fail_insert {
            if fail_table == table && *fail_batch == batch {
                return Err(MigrateError::Statement("value too long for type".into()));
            }
        }
        let Some((cols, stored)) = data.tables.get_mut(table) else {
            return Err(MigrateError::Statement(format!(
                "relation \"{}\" does not exist",
                table
            )));
        };
        *cols = columns.to_vec();
        stored.extend(rows.iter().cloned());
        data.inserts.push((table.to_string(), rows.len()));
        Ok(rows.len() as u64)
    }

    async fn suspend_integrity(&self) -> Result<()> {
        self.data.lock().unwrap().suspended += 1;
        Ok(())
    }

    async fn restore_integrity(&self) -> Result<()> {
        self.data.lock().unwrap().restored += 1;
        Ok(())
    }

    async fn reset_sequence(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let mut data = self.data.lock().unwrap();
        let Some((cols, rows)) = data.tables.get(table) else {
            return Ok(None);
        };
        let max = cols
            .iter()
            .position(|c| c == column)
            .and_then(|idx| rows.iter().filter_map(|r| r[idx].as_i64()).max());
        let next = max.map(|m| m + 1).unwrap_or(1);
        data.sequences.insert(table.to_string(), next);
        Ok(Some(next))
    }

    async fn reset(&self) -> Result<usize> {
        if let Some(delay) = self.reset_delay {
            tokio::time::sleep(delay).await;
        }
        let mut data = self.data.lock().unwrap();
        let dropped = data.tables.len();
        *data = TargetData::default();
        Ok(dropped)
    }
}

fn int(name: &str) -> Column {
    let mut c = Column::new(name, "int");
    c.column_type = "int(11)".into();
    c
}

fn text(name: &str) -> Column {
    let mut c = Column::new(name, "varchar");
    c.column_type = "varchar(100)".into();
    c
}

/// customers <- orders <- order_items, plus employees <-> departments.
pub fn shop_schema() -> SchemaDescription {
    SchemaDescription {
        database: "shop".into(),
        tables: vec![
            TableMeta::new("customers")
                .column(int("id"))
                .column(text("name"))
                .primary_key(&["id"]),
            TableMeta::new("orders")
                .column(int("id"))
                .column(int("customer_id"))
                .primary_key(&["id"])
                .foreign_key("fk_orders_customer", &["customer_id"], "customers", &["id"]),
            TableMeta::new("order_items")
                .column(int("id"))
                .column(int("order_id"))
                .column(text("sku"))
                .primary_key(&["id"])
                .foreign_key("fk_order_items_order", &["order_id"], "orders", &["id"]),
            TableMeta::new("employees")
                .column(int("id"))
                .column(int("department_id"))
                .primary_key(&["id"])
                .foreign_key("fk_employees_department", &["department_id"], "departments", &["id"]),
            TableMeta::new("departments")
                .column(int("id"))
                .column(int("manager_id"))
                .primary_key(&["id"])
                .foreign_key("fk_departments_manager", &["manager_id"], "employees", &["id"]),
        ],
        ..Default::default()
    }
}

/// Transformer output for `shop_schema`.
pub fn shop_objects() -> Vec<SchemaObject> {
    vec![
        SchemaObject::new("customers", ObjectKind::Table, "CREATE TABLE customers (id serial PRIMARY KEY, name varchar(100));"),
        SchemaObject::new("orders", ObjectKind::Table, "CREATE TABLE orders (id serial PRIMARY KEY, customer_id int);"),
        SchemaObject::new("order_items", ObjectKind::Table, "CREATE TABLE order_items (id serial PRIMARY KEY, order_id int, sku varchar(100));"),
        SchemaObject::new("employees", ObjectKind::Table, "CREATE TABLE employees (id serial PRIMARY KEY, department_id int);"),
        SchemaObject::new("departments", ObjectKind::Table, "CREATE TABLE departments (id serial PRIMARY KEY, manager_id int);"),
        SchemaObject::new(
            "idx_orders_customer",
            ObjectKind::Index,
            "CREATE INDEX idx_orders_customer ON orders (customer_id);",
        )
        .depends_on("orders"),
        SchemaObject::new(
            "fk_orders_customer",
            ObjectKind::Constraint,
            "ALTER TABLE orders ADD CONSTRAINT fk_orders_customer FOREIGN KEY (customer_id) REFERENCES customers (id);",
        )
        .depends_on("orders")
        .depends_on("customers"),
        SchemaObject::new(
            "fk_employees_department",
            ObjectKind::Constraint,
            "ALTER TABLE employees ADD CONSTRAINT fk_employees_department FOREIGN KEY (department_id) REFERENCES departments (id);",
        )
        .depends_on("employees")
        .depends_on("departments"),
        SchemaObject::new(
            "order_totals",
            ObjectKind::View,
            "CREATE VIEW order_totals AS SELECT order_id, count(*) FROM order_items GROUP BY order_id;",
        )
        .depends_on("order_items"),
        SchemaObject::new(
            "touch_order",
            ObjectKind::Routine,
            "CREATE FUNCTION touch_order() RETURNS trigger AS $$ BEGIN NEW.id := NEW.id; RETURN NEW; END; $$ LANGUAGE plpgsql;",
        ),
        SchemaObject::new(
            "trg_touch_order",
            ObjectKind::Trigger,
            "CREATE TRIGGER trg_touch_order BEFORE UPDATE ON orders FOR EACH ROW EXECUTE FUNCTION touch_order();",
        )
        .depends_on("orders"),
    ]
}

/// 3 customers, `orders` orders, one item per order for the first 10,
/// and a two-row employee/department cycle.
pub fn shop_source(orders: i64) -> MemorySource {
    MemorySource::new()
        .with_rows(
            "customers",
            (1..=3)
                .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("customer {i}"))])
                .collect(),
        )
        .with_rows(
            "orders",
            (1..=orders)
                .map(|i| vec![SqlValue::I64(i), SqlValue::I64(i % 3 + 1)])
                .collect(),
        )
        .with_rows(
            "order_items",
            (1..=orders.min(10))
                .map(|i| vec![SqlValue::I64(i), SqlValue::I64(i), SqlValue::Text(format!("SKU-{i}"))])
                .collect(),
        )
        .with_rows(
            "employees",
            vec![
                vec![SqlValue::I64(1), SqlValue::I64(10)],
                vec![SqlValue::I64(2), SqlValue::I64(20)],
            ],
        )
        .with_rows(
            "departments",
            vec![
                vec![SqlValue::I64(10), SqlValue::I64(1)],
                vec![SqlValue::I64(20), SqlValue::I64(2)],
            ],
        )
}

/// Config pointing at unreachable hosts, with `migration` overrides appended.
pub fn config(migration: &str) -> Config {
    let yaml = format!(
        r#"
source:
  host: mysql.internal
  database: shop
  user: reader
target:
  host: pg.internal
  database: shop
  user: writer
verification:
  host: pg-verify.internal
  database: shop_verify
  user: writer
migration:
  batch_size: 1000
{}
"#,
        migration
    );
    Config::from_yaml(&yaml).unwrap()
}
