//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// The deployment plan could not be constructed
    #[error("Plan construction failed: {0}")]
    Plan(String),

    /// Foreign keys form a cycle and deferred constraint handling is disabled
    #[error("Dependency cycle between tables: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// A database call exceeded its time bound
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A single statement failed on a driver without structured errors
    #[error("Statement failed: {0}")]
    Statement(String),

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Remove the state file to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        MigrateError::Timeout {
            operation: operation.into(),
            seconds: duration.as_secs(),
        }
    }

    /// Text used to match known error signatures.
    ///
    /// For PostgreSQL errors this is the server message rather than the
    /// generic "db error" display of `tokio_postgres::Error`.
    pub fn detail(&self) -> String {
        match self {
            MigrateError::Target(e) => match e.as_db_error() {
                Some(db) => db.message().to_string(),
                None => e.to_string(),
            },
            MigrateError::Source(sqlx::Error::Database(db)) => db.message().to_string(),
            MigrateError::Statement(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// True when the error is a time bound being exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MigrateError::Timeout { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::ConfigChanged | MigrateError::Yaml(_) => 2,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 3,
            MigrateError::Plan(_) | MigrateError::DependencyCycle(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_uses_statement_text() {
        let err = MigrateError::Statement("relation \"users\" already exists".into());
        assert_eq!(err.detail(), "relation \"users\" already exists");
    }

    #[test]
    fn test_cycle_display_lists_members() {
        let err = MigrateError::DependencyCycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Dependency cycle between tables: a, b");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::Plan("x".into()).exit_code(), 4);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(
            MigrateError::timeout("insert", std::time::Duration::from_secs(5)).exit_code(),
            1
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = MigrateError::timeout("statement", std::time::Duration::from_secs(300));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "statement timed out after 300s");
    }
}
