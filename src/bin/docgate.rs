//! docgate admin binary
//!
//! Control-plane administration of a gateway backed by the in-memory
//! engine, persisted as a snapshot in the data directory.
//!
//! # Examples
//!
//! ```bash
//! # Create a database with two collections
//! docgate db create shop -c orders:order_id=string,total=number -c customers:email=string
//!
//! # List databases
//! docgate db list
//!
//! # Add and drop collections
//! docgate collection add --db shop invoices:number=string
//! docgate collection drop --db shop invoices
//!
//! # Compare catalog and storage, once or every audit interval
//! docgate audit
//! docgate audit --watch
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use docgate::catalog::{CollectionSpec, FieldSpec};
use docgate::page::PageRequest;
use docgate::storage::Filter;
use docgate::{Gateway, GatewayConfig, MemoryDriver};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// docgate - metadata-governed document database gateway
#[derive(Parser, Debug)]
#[command(name = "docgate")]
#[command(version = docgate::VERSION)]
#[command(about = "Administer catalog-governed document databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "DOCGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the engine snapshot
    #[arg(long, global = true, default_value = "data/docgate", env = "DOCGATE_DATA")]
    data_dir: PathBuf,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "DOCGATE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Collection operations
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },

    /// Report drift between catalog and storage
    Audit {
        /// Keep auditing at the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Create a database with its collections
    Create {
        /// Database name
        name: String,
        /// Collection as `name:field=type,field=type`
        #[arg(short, long = "collection", value_parser = parse_collection_spec)]
        collections: Vec<CollectionSpec>,
        /// Owning user
        #[arg(long)]
        owner: Option<String>,
    },

    /// Drop a database and its physical storage
    Drop {
        /// Database name
        name: String,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// List databases
    List {
        /// Only databases owned by this user
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value = "1")]
        page: u64,
        #[arg(long, default_value = "0")]
        page_size: u64,
    },

    /// Show a database's catalog record and drift
    Info {
        /// Database name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum CollectionCommands {
    /// Add collections to a database
    Add {
        /// Database name
        #[arg(short, long)]
        db: String,
        /// Collection as `name:field=type,field=type`
        #[arg(required = true, value_parser = parse_collection_spec)]
        collections: Vec<CollectionSpec>,
    },

    /// Drop collections from a database
    Drop {
        /// Database name
        #[arg(short, long)]
        db: String,
        /// Collection names
        #[arg(required = true)]
        names: Vec<String>,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = GatewayConfig::load(cli.config.as_deref())?;
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("creating {}", cli.data_dir.display()))?;
    let driver = MemoryDriver::open(cli.data_dir.join("docgate.json"))?;
    let gateway = Gateway::open(config, Arc::new(driver.clone())).await?;

    let result = match cli.command {
        Commands::Db { command } => db_command(&gateway, command).await,
        Commands::Collection { command } => collection_command(&gateway, command).await,
        Commands::Audit { watch } => audit_command(&gateway, watch).await,
    };

    driver.persist()?;
    result
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "docgate.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Parses `orders:order_id=string,total=number`; a bare name declares no
/// fields and a field without `=type` is left untyped.
fn parse_collection_spec(raw: &str) -> Result<CollectionSpec, String> {
    let (name, fields) = raw.split_once(':').unwrap_or((raw, ""));
    if name.trim().is_empty() {
        return Err(format!("missing collection name in '{}'", raw));
    }
    let fields = fields
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|field| match field.split_once('=') {
            Some((name, ty)) => FieldSpec::new(name.trim(), ty.trim()),
            None => FieldSpec {
                name: field.to_string(),
                field_type: None,
            },
        })
        .collect();
    Ok(CollectionSpec::new(name.trim(), fields))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Database commands
async fn db_command(gateway: &Gateway, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Create {
            name,
            collections,
            owner,
        } => {
            info!(db = %name, "Creating database...");
            let created = gateway
                .lifecycle()
                .create_database_with_collections(&name, &collections, owner)
                .await?;
            print_json(&created)
        }
        DbCommands::Drop { name, force } => {
            let record = gateway.metadata().get_by_name(&name).await?;
            let confirmation = if force {
                record.database_name.clone()
            } else {
                confirm(&format!(
                    "Type the database name to drop '{}' and all of its collections: ",
                    record.database_name
                ))?
            };
            let removed = gateway
                .lifecycle()
                .drop_database_and_collections(&record.id, &confirmation)
                .await?;
            println!("Dropped database '{}'", removed.database_name);
            Ok(())
        }
        DbCommands::List {
            owner,
            page,
            page_size,
        } => {
            let request = PageRequest::new(page, page_size);
            let listing = match owner {
                Some(owner) => gateway.metadata().list_for_owner(&owner, request).await?,
                None => gateway.metadata().list(&Filter::all(), request).await?,
            };
            print_json(&listing)
        }
        DbCommands::Info { name } => {
            let record = gateway.metadata().get_by_name(&name).await?;
            let drift = gateway.drift().diff(&record.id).await?;
            print_json(&serde_json::json!({ "record": record, "drift": drift }))
        }
    }
}

/// Collection commands
async fn collection_command(gateway: &Gateway, command: CollectionCommands) -> anyhow::Result<()> {
    match command {
        CollectionCommands::Add { db, collections } => {
            let record = gateway.metadata().get_by_name(&db).await?;
            let added = gateway
                .lifecycle()
                .add_collections_with_creation(&record.id, &collections)
                .await?;
            print_json(&added)
        }
        CollectionCommands::Drop { db, names, force } => {
            let record = gateway.metadata().get_by_name(&db).await?;
            if !force {
                let answer = confirm(&format!(
                    "Drop {} from '{}'? (yes/no): ",
                    names.join(", "),
                    record.database_name
                ))?;
                if answer.to_lowercase() != "yes" {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            let removed = gateway
                .lifecycle()
                .drop_collections_with_removal(&record.id, &names)
                .await?;
            println!("Dropped {}", removed.join(", "));
            Ok(())
        }
    }
}

/// Audit command
async fn audit_command(gateway: &Gateway, watch: bool) -> anyhow::Result<()> {
    if !watch {
        let report = gateway.drift().audit_all().await?;
        return print_json(&report);
    }

    let handle = gateway.spawn_audit(|report| match serde_json::to_string(report) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "Failed to render audit report"),
    });
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collection_spec() {
        let spec = parse_collection_spec("orders:order_id=string, total=number").unwrap();
        assert_eq!(spec.name, "orders");
        assert_eq!(spec.fields.len(), 2);
        assert_eq!(spec.fields[1].field_type.as_deref(), Some("number"));

        let bare = parse_collection_spec("logs").unwrap();
        assert!(bare.fields.is_empty());

        assert!(parse_collection_spec(":a=string").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "docgate",
            "db",
            "create",
            "shop",
            "-c",
            "orders:total=number",
            "--owner",
            "u1",
        ])
        .unwrap();
        match cli.command {
            Commands::Db {
                command: DbCommands::Create { collections, owner, .. },
            } => {
                assert_eq!(collections.len(), 1);
                assert_eq!(owner.as_deref(), Some("u1"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
