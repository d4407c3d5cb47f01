use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use explorer_node::{
    api::{serve, validation::validate_event, AppState},
    config::ExplorerConfig,
    security::{
        auth::{hash_api_key, Authenticator, Role},
        crash_log::{install_panic_hook, CrashKind, CrashReport},
    },
    storage::{LedgerEvent, LedgerStore},
};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Ledger explorer API
#[derive(Parser)]
#[clap(name = "explorer-api")]
#[clap(about = "Ledger explorer query API with SQL input sanitization and server protection")]
struct Args {
    /// Path to a TOML configuration file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Override the configured listen port
        #[clap(long)]
        port: Option<u16>,

        /// Override the configured database path
        #[clap(long)]
        db: Option<PathBuf>,
    },
    /// Print a signed bearer token
    Token {
        #[clap(long)]
        sub: String,

        /// reader or admin
        #[clap(long, default_value = "reader")]
        role: String,

        /// Lifetime in seconds
        #[clap(long)]
        ttl: Option<u64>,
    },
    /// Print the digest to configure for an API key
    HashKey { key: String },
    /// Load events from a JSON array or JSON-lines file into the store
    Ingest {
        file: PathBuf,

        #[clap(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::HashKey { key } => {
            println!("{}", hash_api_key(&key));
            Ok(())
        }
        Command::Token { sub, role, ttl } => {
            let config = ExplorerConfig::load(args.config.as_deref())?;
            let role = Role::parse(&role).with_context(|| format!("unknown role '{}'", role))?;
            let token = Authenticator::from_config(&config.auth).issue_token(&sub, role, ttl)?;
            println!("{}", token);
            Ok(())
        }
        Command::Ingest { file, db } => {
            let mut config = ExplorerConfig::load(args.config.as_deref())?;
            if let Some(db) = db {
                config.database.path = db;
            }
            ingest_file(&config, &file)
        }
        Command::Serve { port, db } => {
            let mut config = ExplorerConfig::load(args.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db) = db {
                config.database.path = db;
            }
            config.validate()?;
            run_server(config).await
        }
    }
}

async fn run_server(config: ExplorerConfig) -> Result<()> {
    info!("Opening ledger store at {}", config.database.path.display());
    let store = LedgerStore::open(&config.database.path)?;
    let state = AppState::new(config, store);
    install_panic_hook(state.crash_log.clone());
    info!("Recording crashes to {}", state.crash_log.path().display());

    let crash_log = Arc::clone(&state.crash_log);
    if let Err(e) = serve(state).await {
        error!("Explorer API failed: {}", e);
        let report = CrashReport::new(CrashKind::Fatal, e.to_string());
        if let Err(log_err) = crash_log.record(&report) {
            error!("Could not record fatal error: {}", log_err);
        }
        return Err(e.into());
    }
    Ok(())
}

fn ingest_file(config: &ExplorerConfig, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let events = parse_events(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let mut valid = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
        match validate_event(event) {
            Ok(event) => valid.push(event),
            Err(errors) => {
                let fields: Vec<_> = errors.errors.iter().map(|e| e.field.as_str()).collect();
                bail!("event #{} is invalid ({})", index, fields.join(", "));
            }
        }
    }

    let store = LedgerStore::open(&config.database.path)?;
    let inserted = store.insert_events(&valid)?;
    info!(
        "Ingested {} new events from {} ({} read)",
        inserted,
        file.display(),
        valid.len()
    );
    Ok(())
}

/// A JSON array, or one JSON object per line
fn parse_events(raw: &str) -> Result<Vec<LedgerEvent>> {
    if raw.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(raw)?);
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", n + 1))
        })
        .collect()
}
