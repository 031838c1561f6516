//! Configuration validation.

use super::{Config, TargetConfig};
use crate::db::SslMode;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mysql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mysql', got '{}'",
            config.source.r#type
        )));
    }

    validate_target("target", &config.target)?;
    if let Some(verification) = &config.verification {
        validate_target("verification", verification)?;

        // The verification database is reset before every run
        if same_database(verification, &config.target) {
            return Err(MigrateError::Config(
                "verification and target cannot be the same database".into(),
            ));
        }
    }

    // Cannot migrate to the same database
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let m = &config.migration;
    if m.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if m.statement_timeout_secs == 0 || m.batch_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "migration timeouts must be at least 1 second".into(),
        ));
    }
    if m.block_marker.trim().is_empty() || m.block_marker.contains(';') {
        return Err(MigrateError::Config(
            "migration.block_marker must be non-empty and must not contain ';'".into(),
        ));
    }
    if let Some(0) = m.tier_concurrency {
        return Err(MigrateError::Config(
            "migration.tier_concurrency must be at least 1".into(),
        ));
    }
    if let Some(conns) = m.max_target_connections {
        // One connection stays pinned for the load session
        if conns < 2 {
            return Err(MigrateError::Config(
                "migration.max_target_connections must be at least 2".into(),
            ));
        }
    }

    Ok(())
}

fn validate_target(section: &str, target: &TargetConfig) -> Result<()> {
    if target.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", section)));
    }
    if target.database.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.database is required",
            section
        )));
    }
    if target.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", section)));
    }
    if target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "{}.type must be 'postgres', got '{}'",
            section, target.r#type
        )));
    }
    if SslMode::parse(&target.ssl_mode).is_err() {
        return Err(MigrateError::Config(format!(
            "{}.ssl_mode must be one of disable, prefer, require, verify-full, got '{}'",
            section, target.ssl_mode
        )));
    }
    Ok(())
}

fn same_database(a: &TargetConfig, b: &TargetConfig) -> bool {
    a.host == b.host && a.port == b.port && a.database == b.database
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig};

    fn target(host: &str, database: &str) -> TargetConfig {
        TargetConfig {
            r#type: "postgres".to_string(),
            host: host.to_string(),
            port: 5432,
            database: database.to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            schema: "public".to_string(),
            ssl_mode: "disable".to_string(),
        }
    }

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                r#type: "mysql".to_string(),
                host: "localhost".to_string(),
                port: 3306,
                database: "source_db".to_string(),
                user: "root".to_string(),
                password: "password".to_string(),
                ssl: false,
            },
            target: target("localhost", "target_db"),
            verification: Some(target("localhost", "verify_db")),
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_source_type() {
        let mut config = valid_config();
        config.source.r#type = "mssql".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.type"));
    }

    #[test]
    fn test_verification_section_is_named_in_errors() {
        let mut config = valid_config();
        if let Some(v) = config.verification.as_mut() {
            v.user = String::new();
        }
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("verification.user"));
    }

    #[test]
    fn test_verification_cannot_be_target() {
        let mut config = valid_config();
        config.verification = Some(target("localhost", "target_db"));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "allow".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.ssl_mode"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_block_marker_with_semicolon() {
        let mut config = valid_config();
        config.migration.block_marker = ";;".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_single_target_connection_rejected() {
        let mut config = valid_config();
        config.migration.max_target_connections = Some(1);
        assert!(validate(&config).is_err());
    }
}
