//! Concept Graph CLI: inspect and maintain persisted keyspaces.
//!
//! Usage:
//!   concept-graph keyspaces [--db path]
//!   concept-graph stats --keyspace <name> [--db path]
//!   concept-graph dedup --keyspace <name> --label <attribute type> --value <value> [--db path]

use clap::{Parser, Subcommand};
use concept_graph::{
    attribute_index, AttributeValue, Config, Deduplicator, KeyspaceIndexPair, SessionFactory,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "concept-graph", version, about = "Typed concept layer over a property graph")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the keyspaces stored in the database
    Keyspaces,
    /// Print per-type instance and shard counts
    Stats {
        #[arg(long)]
        keyspace: String,
    },
    /// Merge duplicate attributes of one type and value
    Dedup {
        #[arg(long)]
        keyspace: String,
        /// Attribute type label
        #[arg(long)]
        label: String,
        /// Attribute value, parsed with the attribute type's data type
        #[arg(long)]
        value: String,
    },
}

/// Get the default database path (~/.local/share/concept-graph/concepts.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("concept-graph");
    std::fs::create_dir_all(&dir).ok();
    dir.join("concepts.db")
}

fn open_factory(db: Option<PathBuf>, config: Option<PathBuf>) -> Result<SessionFactory, String> {
    let mut config = match config {
        Some(path) => Config::load(&path).map_err(|e| format!("Failed to load config: {}", e))?,
        None => Config::default(),
    };
    if db.is_some() || config.storage.path.is_none() {
        config.storage.path = Some(db.unwrap_or_else(default_db_path));
    }
    SessionFactory::new(config).map_err(|e| format!("Failed to open database: {}", e))
}

fn cmd_keyspaces(factory: &SessionFactory) -> i32 {
    match factory.list_keyspaces() {
        Ok(names) if names.is_empty() => {
            println!("No keyspaces");
            0
        }
        Ok(names) => {
            for name in names {
                println!("{}", name);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_stats(factory: &SessionFactory, keyspace: &str) -> i32 {
    let result = (|| {
        let session = factory.session(keyspace)?;
        let mut tx = session.read();
        let Some(thing) = tx.get_schema_concept("thing")? else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        for concept_type in tx.subs(&thing)? {
            let label = tx.label(&concept_type)?;
            let instances = tx.instance_count(&concept_type)?;
            let shards = tx.shard_count(&concept_type)?;
            rows.push((label, instances, shards));
        }
        Ok::<_, concept_graph::ConceptError>(rows)
    })();
    match result {
        Ok(rows) => {
            println!("{:<40} {:>12} {:>8}", "TYPE", "INSTANCES", "SHARDS");
            for (label, instances, shards) in rows {
                println!("{:<40} {:>12} {:>8}", label, instances, shards);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_dedup(factory: &SessionFactory, keyspace: &str, label: &str, raw: &str) -> i32 {
    let index = (|| {
        let session = factory.session(keyspace)?;
        let mut tx = session.read();
        let Some(attribute_type) = tx.get_attribute_type(label)? else {
            return Ok(Err(format!("no attribute type '{}' in '{}'", label, keyspace)));
        };
        let Some(data_type) = tx.data_type(&attribute_type)? else {
            return Ok(Err(format!("'{}' has no data type", label)));
        };
        Ok::<_, concept_graph::ConceptError>(match AttributeValue::parse(data_type, raw) {
            Some(value) => Ok(attribute_index(label, &value)),
            None => Err(format!("'{}' is not a valid {} value", raw, data_type)),
        })
    })();
    let index = match index {
        Ok(Ok(index)) => index,
        Ok(Err(message)) => {
            eprintln!("Error: {}", message);
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    match Deduplicator::deduplicate(factory, &KeyspaceIndexPair::new(keyspace, index)) {
        Ok(report) => {
            match report.survivor {
                Some(survivor) => println!(
                    "Merged {} duplicate(s) into {} ({} edges redirected, {} collapsed)",
                    report.merged, survivor, report.redirected_edges, report.collapsed_edges
                ),
                None => println!("No attribute '{}' with value '{}'", label, raw),
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let factory = match open_factory(cli.db, cli.config) {
        Ok(factory) => factory,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let code = match cli.command {
        Commands::Keyspaces => cmd_keyspaces(&factory),
        Commands::Stats { keyspace } => cmd_stats(&factory, &keyspace),
        Commands::Dedup { keyspace, label, value } => cmd_dedup(&factory, &keyspace, &label, &value),
    };
    std::process::exit(code);
}
