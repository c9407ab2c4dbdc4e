//! easel - interactive client for the diagram agent server

mod chat;
mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use config::Config;
use easel_engine::{ConversationEngine, FsBlobStore, FsSnapshotStore, PersistConfig};
use easel_wire::{ApiClient, ReaderConfig};

/// easel - talk to the diagram generation agent
#[derive(Parser, Debug)]
#[command(name = "easel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server base URL (default: http://127.0.0.1:8000)
    #[arg(short, long)]
    server: Option<String>,

    /// Resume a session by ID
    #[arg(long)]
    resume: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List locally known sessions
    Sessions,
    /// Show server-side metadata for a session
    Info { session_id: String },
    /// Delete a session locally and on the server
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        let path = Config::init()?;
        println!("Config file at {}", path.display());
        return Ok(());
    }

    let config = Config::load();
    let server_url = args
        .server
        .or_else(|| config.server_url.clone())
        .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
    let reader = ReaderConfig {
        stall_timeout: Duration::from_secs(config.stall_timeout_secs.unwrap_or(120)),
    };
    let api = Arc::new(ApiClient::new(&server_url).with_reader_config(reader));

    let data_dir = config.resolve_data_dir();
    let engine = Arc::new(ConversationEngine::new(
        api.clone(),
        Arc::new(FsSnapshotStore::new(data_dir.join("threads.json"))),
        Arc::new(FsBlobStore::new(data_dir.join("blobs"))),
        PersistConfig::default(),
    ));
    engine.hydrate().await;

    match args.command {
        None => chat::run(engine, args.resume).await,
        Some(Command::Sessions) => {
            let sessions = engine.sessions();
            if sessions.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            for meta in sessions {
                println!(
                    "{}  {:<40}  {:>3} exchanges  {}  {}",
                    meta.id,
                    meta.title,
                    meta.exchange_count,
                    meta.backend.as_deref().unwrap_or("-"),
                    meta.last_active_display(),
                );
            }
            Ok(())
        }
        Some(Command::Info { session_id }) => {
            let info = api.get_session(&session_id).await?;
            println!("id:             {}", info.id);
            println!("created:        {}", info.created_at);
            println!("last activity:  {}", info.last_activity);
            println!("messages:       {}", info.message_count);
            println!("renders:        {}", info.render_ids.join(", "));
            if let Some(current) = info.current_render_id {
                println!("current render: {current}");
            }
            Ok(())
        }
        Some(Command::Delete { session_id }) => {
            engine.delete_session(&session_id).await?;
            engine.flush().await;
            println!("Deleted session {session_id}");
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
