//! relguard CLI - inspect a schema and run guarded operations against it.

use clap::{Parser, Subcommand};
use relguard::{Config, Guard, GuardError, RowMap, SqlValue, ValidationMode};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "relguard")]
#[command(about = "Schema-aware data access and phased DDL for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON instead of plain lines
    #[arg(long)]
    output_json: bool,

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
    /// Test the database connection
    HealthCheck,

    /// List tables of the configured schema
    Tables,

    /// Show columns, keys and interpreted rules of a table
    Describe {
        table: String,
    },

    /// List join columns derived from foreign keys
    Joins,

    /// Show the id the next insert into a table would receive
    FreeId {
        table: String,
    },

    /// Validate a JSON row against a table without writing it
    Validate {
        table: String,

        /// Row as a JSON object, e.g. '{"full_name": "Ann"}'
        row: String,

        /// Validate as a partial update instead of an insert
        #[arg(long)]
        update: bool,
    },

    /// Drop a column, refusing when other objects depend on it
    DropColumn {
        table: String,
        column: String,

        /// Drop dependent objects too
        #[arg(long)]
        force: bool,
    },

    /// Rename a column
    RenameColumn {
        table: String,
        old: String,
        new: String,
    },

    /// Show DDL operations left unfinished by an earlier run
    PendingDdl {
        /// Mark them as abandoned
        #[arg(long)]
        acknowledge: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), GuardError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(GuardError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Parse the row before connecting so malformed input fails fast.
    let pending_row = match &cli.command {
        Commands::Validate { row, .. } => Some(parse_row(row)?),
        _ => None,
    };

    let guard = Guard::connect(&config).await?;

    match cli.command {
        Commands::HealthCheck => {
            let start = std::time::Instant::now();
            guard.health_check().await?;
            let latency_ms = start.elapsed().as_millis();
            if cli.output_json {
                let result = serde_json::json!({ "healthy": true, "latency_ms": latency_ms });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("PostgreSQL: OK ({}ms)", latency_ms);
            }
        }

        Commands::Tables => {
            let tables = guard.catalog().list_tables();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                for table in tables {
                    println!("{}", table);
                }
            }
        }

        Commands::Describe { table } => {
            let table = guard.describe(&table)?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(table.as_ref())?);
            } else {
                println!("{}", table.full_name());
                for col in &table.columns {
                    println!(
                        "  {} {} ({}){}{}",
                        col.name,
                        col.sql_type,
                        col.kind,
                        if col.is_nullable { "" } else { " NOT NULL" },
                        if col.is_primary_key { " PK" } else { "" }
                    );
                }
                for fk in &table.foreign_keys {
                    println!(
                        "  FK {} ({}) -> {} ({})",
                        fk.name,
                        fk.columns.join(", "),
                        fk.ref_table,
                        fk.ref_columns.join(", ")
                    );
                }
                for (column, rules) in &table.rules {
                    for rule in rules {
                        println!("  rule on {}: {}", column, rule);
                    }
                }
            }
        }

        Commands::Joins => {
            let edges = guard.join_edges();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&edges)?);
            } else {
                for e in edges {
                    println!(
                        "{}.{} -> {}.{}",
                        e.child_table, e.child_column, e.parent_table, e.parent_column
                    );
                }
            }
        }

        Commands::FreeId { table } => {
            let id = guard.find_free_id(&table).await?;
            if cli.output_json {
                println!("{}", serde_json::json!({ "table": table, "id": id }));
            } else {
                println!("{}", id);
            }
        }

        Commands::Validate { table, update, .. } => {
            let row = pending_row.unwrap_or_default();
            let mode = if update {
                ValidationMode::Update
            } else {
                ValidationMode::Insert
            };
            let violations = guard.validate(&table, &row, mode)?;
            if !violations.is_empty() {
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&violations)?);
                }
                return Err(GuardError::validation(table, violations));
            }
            if cli.output_json {
                println!("{}", serde_json::json!({ "table": table, "valid": true }));
            } else {
                println!("valid");
            }
        }

        Commands::DropColumn {
            table,
            column,
            force,
        } => {
            let dropped = guard.ddl().drop_column(&table, &column, force).await?;
            if cli.output_json {
                let result = serde_json::json!({ "dropped": column, "dependents": dropped });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Dropped {}.{}", table, column);
                for d in dropped {
                    println!("  also dropped {}", d);
                }
            }
        }

        Commands::RenameColumn { table, old, new } => {
            let dependents = guard.ddl().rename_column(&table, &old, &new).await?;
            if cli.output_json {
                let result = serde_json::json!({ "renamed": old, "to": new, "dependents": dependents });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "Renamed {}.{} to {} ({} dependent objects)",
                    table, old, new, dependents
                );
            }
        }

        Commands::PendingDdl { acknowledge } => {
            let pending = guard.pending_ddl().await;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("No unfinished DDL");
            } else {
                for entry in &pending {
                    println!(
                        "#{} {} on {} started {}; applied: [{}]",
                        entry.id,
                        entry.operation,
                        entry.table,
                        entry.started_at,
                        entry.applied_phases().join(", ")
                    );
                }
            }
            if acknowledge && !pending.is_empty() {
                let count = guard.acknowledge_pending_ddl().await?;
                info!("Marked {} DDL operations as abandoned", count);
            }
        }
    }

    Ok(())
}

/// Parse a JSON object into a row map.
fn parse_row(text: &str) -> Result<RowMap, GuardError> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, SqlValue::from_json(v)))
            .collect()),
        other => Err(GuardError::Config(format!(
            "row must be a JSON object, got {}",
            other
        ))),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
