//! Schema metadata from introspection and schema objects from the transformer.
//!
//! Both are read from JSON or YAML files produced by external tools; the engine
//! never parses the DDL it carries beyond statement boundaries.

use crate::error::{MigrateError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Kind of a schema object. Declaration order is deployment tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    Index,
    Constraint,
    View,
    Trigger,
    Routine,
}

impl ObjectKind {
    /// All kinds in the order their tiers are deployed.
    pub const TIERS: [ObjectKind; 6] = [
        ObjectKind::Table,
        ObjectKind::Index,
        ObjectKind::Constraint,
        ObjectKind::View,
        ObjectKind::Trigger,
        ObjectKind::Routine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::Index => "index",
            ObjectKind::Constraint => "constraint",
            ObjectKind::View => "view",
            ObjectKind::Trigger => "trigger",
            ObjectKind::Routine => "routine",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transformed object ready for deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaObject {
    /// Object name, unique within its kind.
    pub name: String,

    /// Object kind, selects the deployment tier.
    pub kind: ObjectKind,

    /// Names of objects (usually tables) that must exist first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Target-dialect text, possibly several statements.
    pub payload: String,
}

impl SchemaObject {
    pub fn new(name: impl Into<String>, kind: ObjectKind, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: BTreeSet::new(),
            payload: payload.into(),
        }
    }

    /// Add a dependency (builder style).
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    /// `kind:name`, unique across the whole plan.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// Load transformer output from a JSON or YAML file.
    pub fn load_all<P: AsRef<Path>>(path: P) -> Result<Vec<SchemaObject>> {
        read_document(path.as_ref())
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Base data type (e.g., "int", "varchar", "geometry").
    pub data_type: String,

    /// Full column type including modifiers (e.g., "tinyint(1)", "int unsigned").
    #[serde(default)]
    pub column_type: String,

    /// Whether the column allows NULL.
    #[serde(default = "default_true")]
    pub is_nullable: bool,

    /// Whether the column is auto-incremented.
    #[serde(default)]
    pub is_identity: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            column_type: data_type.clone(),
            data_type,
            is_nullable: true,
            is_identity: false,
        }
    }

    /// Full type, lowercased, falling back to the base type.
    pub fn full_type(&self) -> String {
        if self.column_type.is_empty() {
            self.data_type.to_lowercase()
        } else {
            self.column_type.to_lowercase()
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.to_lowercase().as_str(),
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }
}

/// Foreign key reference from one table to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    /// Constraint name.
    #[serde(default)]
    pub name: String,

    /// Referencing column names.
    #[serde(default)]
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced column names.
    #[serde(default)]
    pub ref_columns: Vec<String>,
}

impl ForeignKeyRef {
    /// Both column lists are known and pair up, so orphans can be counted.
    pub fn is_checkable(&self) -> bool {
        !self.columns.is_empty() && self.columns.len() == self.ref_columns.len()
    }

    /// Constraint name, or `table->ref_table` when introspection left it blank.
    pub fn label(&self, table: &str) -> String {
        if self.name.is_empty() {
            format!("{}->{}", table, self.ref_table)
        } else {
            self.name.clone()
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table name.
    pub name: String,

    /// Column definitions in source order.
    #[serde(default)]
    pub columns: Vec<Column>,

    /// Primary key column names.
    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Foreign key references (self-references allowed).
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyRef>,

    /// Approximate row count at introspection time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            row_count: None,
        }
    }

    /// Add a column (builder style).
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Set the primary key (builder style).
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Add a foreign key to `ref_table` (builder style).
    pub fn references(mut self, ref_table: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKeyRef {
            name: String::new(),
            columns: Vec::new(),
            ref_table: ref_table.into(),
            ref_columns: Vec::new(),
        });
        self
    }

    /// Add a named foreign key with its column pairs (builder style).
    pub fn foreign_key(
        mut self,
        name: impl Into<String>,
        columns: &[&str],
        ref_table: impl Into<String>,
        ref_columns: &[&str],
    ) -> Self {
        self.foreign_keys.push(ForeignKeyRef {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ref_table: ref_table.into(),
            ref_columns: ref_columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Check if the table has a single-column primary key.
    pub fn has_single_pk(&self) -> bool {
        self.primary_key.len() == 1
    }

    /// Single integer primary key column, used for keyset pagination
    /// and sequence resets.
    pub fn integer_pk(&self) -> Option<&Column> {
        if !self.has_single_pk() {
            return None;
        }
        self.find_column(&self.primary_key[0])
            .filter(|c| c.is_integer())
    }

    /// Referenced table names, self-references included.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys.iter().map(|fk| fk.ref_table.as_str())
    }
}

/// View definition from introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewMeta {
    pub name: String,
    #[serde(default)]
    pub definition: String,
}

/// Trigger definition from introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMeta {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub timing: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub definition: String,
}

/// Stored routine definition from introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineMeta {
    pub name: String,
    /// "procedure" or "function".
    #[serde(default)]
    pub routine_type: String,
    #[serde(default)]
    pub definition: String,
}

/// Introspected source schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    /// Source database name.
    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub tables: Vec<TableMeta>,

    #[serde(default)]
    pub views: Vec<ViewMeta>,

    #[serde(default)]
    pub triggers: Vec<TriggerMeta>,

    #[serde(default)]
    pub routines: Vec<RoutineMeta>,
}

impl SchemaDescription {
    /// Load introspection output from a JSON or YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_document(path.as_ref())
    }

    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Every foreign key as a child -> parent edge.
    pub fn dependency_edges(&self) -> Vec<DependencyEdge> {
        self.tables
            .iter()
            .flat_map(|t| {
                t.referenced_tables().map(move |parent| DependencyEdge {
                    from_table: t.name.clone(),
                    to_table: parent.to_string(),
                })
            })
            .collect()
    }

    /// Names of described objects of `kind`, used to report transformer gaps.
    pub fn described_names(&self, kind: ObjectKind) -> Vec<&str> {
        match kind {
            ObjectKind::Table => self.tables.iter().map(|t| t.name.as_str()).collect(),
            ObjectKind::View => self.views.iter().map(|v| v.name.as_str()).collect(),
            ObjectKind::Trigger => self.triggers.iter().map(|t| t.name.as_str()).collect(),
            ObjectKind::Routine => self.routines.iter().map(|r| r.name.as_str()).collect(),
            ObjectKind::Index | ObjectKind::Constraint => Vec::new(),
        }
    }
}

/// `from_table` depends on `to_table` (child -> parent).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_table: String,
    pub to_table: String,
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MigrateError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_yaml::from_str(&content)?)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_kind_tier_order() {
        let mut kinds = vec![ObjectKind::Routine, ObjectKind::Table, ObjectKind::View];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![ObjectKind::Table, ObjectKind::View, ObjectKind::Routine]
        );
        assert_eq!(ObjectKind::TIERS[2], ObjectKind::Constraint);
    }

    #[test]
    fn test_integer_pk() {
        let t = TableMeta::new("users")
            .column(Column::new("id", "bigint"))
            .column(Column::new("email", "varchar"))
            .primary_key(&["id"]);
        assert_eq!(t.integer_pk().map(|c| c.name.as_str()), Some("id"));

        let composite = TableMeta::new("m2m")
            .column(Column::new("a", "int"))
            .column(Column::new("b", "int"))
            .primary_key(&["a", "b"]);
        assert!(composite.integer_pk().is_none());

        let text_pk = TableMeta::new("codes")
            .column(Column::new("code", "varchar"))
            .primary_key(&["code"]);
        assert!(text_pk.integer_pk().is_none());
    }

    #[test]
    fn test_dependency_edges() {
        let schema = SchemaDescription {
            tables: vec![
                TableMeta::new("orders").references("users"),
                TableMeta::new("users"),
                TableMeta::new("employees").references("employees"),
            ],
            ..Default::default()
        };
        let edges = schema.dependency_edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].from_table, "orders");
        assert_eq!(edges[0].to_table, "users");
        assert_eq!(edges[1].from_table, edges[1].to_table);
    }

    #[test]
    fn test_foreign_key_checkable_and_label() {
        let t = TableMeta::new("orders")
            .foreign_key("fk_orders_customer", &["customer_id"], "customers", &["id"])
            .references("customers");
        assert!(t.foreign_keys[0].is_checkable());
        assert_eq!(t.foreign_keys[0].label("orders"), "fk_orders_customer");
        assert!(!t.foreign_keys[1].is_checkable());
        assert_eq!(t.foreign_keys[1].label("orders"), "orders->customers");
    }

    #[test]
    fn test_load_json_and_yaml() {
        let mut json = Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            json,
            r#"{{"database":"shop","tables":[{{"name":"users","columns":[{{"name":"id","data_type":"int"}}],"primary_key":["id"]}}]}}"#
        )
        .unwrap();
        let schema = SchemaDescription::load(json.path()).unwrap();
        assert_eq!(schema.database, "shop");
        assert!(schema.tables[0].columns[0].is_nullable);

        let mut yaml = Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            yaml,
            "- name: users\n  kind: table\n  payload: CREATE TABLE users (id int);\n- name: idx_users\n  kind: index\n  depends_on: [users]\n  payload: CREATE INDEX idx_users ON users (id);\n"
        )
        .unwrap();
        let objects = SchemaObject::load_all(yaml.path()).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].kind, ObjectKind::Index);
        assert!(objects[1].depends_on.contains("users"));
        assert_eq!(objects[1].key(), "index:idx_users");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = SchemaDescription::load("/nonexistent/schema.json").unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }
}
