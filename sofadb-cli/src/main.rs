use clap::{Parser, Subcommand};
use sofadb::{Document, Engine};
use std::collections::HashMap;
use std::io::Read;
use std::process;

/// SofaDB CLI: operate on a SofaDB data directory from the command line
#[derive(Parser)]
#[command(name = "sofadb", version, about)]
struct Cli {
    /// Path to the data directory (default: ./data)
    #[arg(long, default_value = "data")]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all databases
    Databases,

    /// Create a database
    CreateDb {
        /// Database name
        name: String,
    },

    /// Delete a database and its view files
    DeleteDb {
        /// Database name
        name: String,
    },

    /// Show database statistics
    Stat {
        /// Database name
        db: String,
    },

    /// Get a document by id
    Get {
        /// Database name
        db: String,
        /// Document id
        id: String,
        /// Fetch one exact revision instead of the latest
        #[arg(long)]
        version: Option<i64>,
    },

    /// Store a document from a JSON body (argument or stdin)
    Put {
        /// Database name
        db: String,
        /// JSON body; reads stdin when omitted
        body: Option<String>,
    },

    /// Delete a document
    Delete {
        /// Database name
        db: String,
        /// Document id
        id: String,
        /// Current document version
        #[arg(long)]
        version: i64,
    },

    /// Show the change feed
    Changes {
        /// Database name
        db: String,
        /// Only changes after this sequence ("<number>-<id>")
        #[arg(long)]
        since: Option<String>,
        /// Maximum number of entries
        #[arg(long, default_value_t = 0)]
        limit: i64,
    },

    /// Select from a view
    View {
        /// Database name
        db: String,
        /// Design document name (without the _design/ prefix)
        ddoc: String,
        /// View name
        view: String,
        /// Select name
        #[arg(long, default_value = "default")]
        select: String,
        /// Query parameters (e.g. --param key=a)
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
        /// Skip bringing the view current before reading
        #[arg(long)]
        stale: bool,
    },

    /// Vacuum a database and its views
    Compact {
        /// Database name
        db: String,
    },

    /// Generate fresh unique ids
    Uuids {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got: {s}"))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let engine = match Engine::new(std::path::Path::new(&cli.data_dir)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to open data directory {}: {e}", cli.data_dir);
            process::exit(1);
        }
    };

    if let Err(e) = run(&engine, cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(engine: &Engine, command: Command) -> sofadb::Result<()> {
    match command {
        Command::Databases => {
            for name in engine.list_databases()? {
                println!("{name}");
            }
        }
        Command::CreateDb { name } => {
            engine.open(&name, true)?;
            println!("created {name}");
        }
        Command::DeleteDb { name } => {
            engine.delete(&name)?;
            println!("deleted {name}");
        }
        Command::Stat { db } => {
            let stat = engine.stat(&db)?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Command::Get { db, id, version } => {
            let stub = Document::from_parts(id, version.unwrap_or(0), false);
            let doc = engine.get_document(&db, &stub, true)?;
            println!("{}", serde_json::to_string_pretty(&doc.to_value())?);
        }
        Command::Put { db, body } => {
            let body = match body {
                Some(body) => body,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let doc = engine.put_document(&db, Document::parse(body.as_bytes())?)?;
            println!("{{\"id\":\"{}\",\"version\":{}}}", doc.id, doc.version);
        }
        Command::Delete { db, id, version } => {
            engine.delete_document(&db, Document::from_parts(id, version, true))?;
            println!("ok");
        }
        Command::Changes { db, since, limit } => {
            let envelope = engine.changes(&db, since.as_deref(), limit)?;
            println!("{}", String::from_utf8_lossy(&envelope));
        }
        Command::View {
            db,
            ddoc,
            view,
            select,
            params,
            stale,
        } => {
            let params: HashMap<String, String> = params.into_iter().collect();
            let result = engine.select_view(
                &db,
                &format!("_design/{ddoc}"),
                &view,
                &select,
                &params,
                stale,
            )?;
            println!("{}", String::from_utf8_lossy(&result));
        }
        Command::Compact { db } => {
            engine.vacuum(&db)?;
            println!("ok");
        }
        Command::Uuids { count } => {
            for id in engine.uuids(count) {
                println!("{id}");
            }
        }
    }
    Ok(())
}
