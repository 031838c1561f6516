//! db-migrate CLI - deterministic MySQL to PostgreSQL schema and data migration.

use clap::{Parser, Subcommand};
use db_migrate::sql::DEFAULT_BLOCK_MARKER;
use db_migrate::{
    Config, DependencyGraphBuilder, DeploymentPlan, MigrateError, Orchestrator, RunStatus,
    SchemaDescription, SchemaObject, StatementSplitter, ValidationStatus,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "db-migrate")]
#[command(about = "Deterministic MySQL to PostgreSQL schema and data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Introspected source schema (JSON or YAML)
    #[arg(long, default_value = "schema.json")]
    schema: PathBuf,

    /// Transformed target objects (JSON or YAML)
    #[arg(long, default_value = "objects.json")]
    objects: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy, load and validate the verification database, then production
    Run {
        /// Go straight to the production target
        #[arg(long)]
        skip_verification: bool,

        /// Output JSON result to stdout
        #[arg(long)]
        output_json: bool,
    },

    /// Print the deployment plan as JSON without connecting to any database
    Plan,

    /// Split a SQL file into top-level statements
    Split {
        /// SQL file to split
        file: PathBuf,

        /// Marker delimiting procedural bodies
        #[arg(long, default_value = DEFAULT_BLOCK_MARKER)]
        block_marker: String,

        /// Output a JSON array instead of one statement per block
        #[arg(long)]
        output_json: bool,
    },

    /// Check object existence and row counts on the target
    Validate {
        /// Output JSON result to stdout
        #[arg(long)]
        output_json: bool,
    },

    /// Test database connections
    HealthCheck {
        /// Output JSON result to stdout
        #[arg(long)]
        output_json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    match cli.command {
        Commands::Split {
            ref file,
            ref block_marker,
            output_json,
        } => {
            let sql = std::fs::read_to_string(file)?;
            let statements = StatementSplitter::new(block_marker.clone()).split(&sql);
            if output_json {
                println!("{}", serde_json::to_string_pretty(&statements)?);
            } else {
                for (i, statement) in statements.iter().enumerate() {
                    println!("-- statement {}\n{}\n", i + 1, statement);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan => {
            // The config only tunes cycle handling here, so it is optional
            let defer_cycles = if cli.config.exists() {
                Config::load(&cli.config)?.migration.defer_cyclic_constraints
            } else {
                true
            };
            let (schema, objects) = load_inputs(&cli.schema, &cli.objects)?;
            let builder = DependencyGraphBuilder::new().defer_cycles(defer_cycles);
            let plan = DeploymentPlan::build(&schema, objects, &builder)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            skip_verification,
            output_json,
        } => {
            let config = Config::load(&cli.config)?.with_auto_tuning();
            info!("Loaded configuration from {:?}", cli.config);
            let (schema, objects) = load_inputs(&cli.schema, &cli.objects)?;

            let cancel_token = setup_signal_handler();

            let mut orchestrator = Orchestrator::new(config, schema, objects);
            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone()).resume()?;
            }

            let result = orchestrator.run(&cancel_token, skip_verification).await?;

            if output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nMigration finished: {:?}", result.status);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Planned objects: {}", result.planned_objects);
                for pass in [&result.verification, &result.production].into_iter().flatten() {
                    println!(
                        "  {} target: schema {} applied, {} auto-fixed, {} skipped, {} failed; \
                         {} tables loaded, {} failed, {} rows; validation {}",
                        pass.target,
                        pass.schema.applied,
                        pass.schema.auto_fixed,
                        pass.schema.skipped,
                        pass.schema.failed,
                        pass.data.tables_loaded,
                        pass.data.tables_failed,
                        pass.data.rows_loaded,
                        pass.validation
                    );
                }
                if let Some(ref gate) = result.gate {
                    println!("  Production not attempted: {}", gate);
                }
            }

            Ok(match result.status {
                RunStatus::Success => ExitCode::SUCCESS,
                RunStatus::Partial => ExitCode::from(5),
                _ => ExitCode::FAILURE,
            })
        }

        Commands::Validate { output_json } => {
            let config = Config::load(&cli.config)?;
            let (schema, objects) = load_inputs(&cli.schema, &cli.objects)?;
            let orchestrator = Orchestrator::new(config, schema, objects);
            let report = orchestrator.validate().await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Validation: {} ({} checks)", report.status, report.records.len());
                for failure in report.failures() {
                    println!(
                        "  FAIL {} {} {:?}: expected {}, found {}",
                        failure.kind, failure.object_name, failure.check, failure.expected, failure.actual
                    );
                }
            }

            Ok(match report.status {
                ValidationStatus::Success => ExitCode::SUCCESS,
                ValidationStatus::Partial => ExitCode::from(5),
                ValidationStatus::Failed => ExitCode::FAILURE,
            })
        }

        Commands::HealthCheck { output_json } => {
            let config = Config::load(&cli.config)?;
            let orchestrator = Orchestrator::new(config, SchemaDescription::default(), Vec::new());
            let result = orchestrator.health_check().await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for endpoint in &result.endpoints {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        endpoint.name,
                        endpoint.endpoint,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool("Health check failed", "health-check"));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_inputs(schema: &Path, objects: &Path) -> Result<(SchemaDescription, Vec<SchemaObject>), MigrateError> {
    let schema = SchemaDescription::load(schema)?;
    let objects = SchemaObject::load_all(objects)?;
    info!(
        "Loaded {} tables and {} objects",
        schema.tables.len(),
        objects.len()
    );
    Ok((schema, objects))
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so JSON output on stdout stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT (Ctrl-C) or SIGTERM.
/// Components finish their current statement or batch and stop.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing the current step and stopping...", name);
                    token.cancel();
                }
                Err(e) => eprintln!("Could not install {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Ctrl-C only outside unix.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing the current step and stopping...");
            token.cancel();
        }
    });

    cancel_token
}
