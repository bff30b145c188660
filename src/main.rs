//! # knowbase CLI
//!
//! ```bash
//! knowbase --config ./config/knowbase.toml init    # create the database
//! knowbase --config ./config/knowbase.toml serve   # start the HTTP server
//! ```
//!
//! All settings (database path, bind address, uploads directory, chunking
//! and retrieval parameters, Ollama endpoint and models) are read from the
//! TOML config file. See `config/knowbase.example.toml`.

mod answer;
mod chunker;
mod config;
mod db;
mod embedding;
mod events;
mod extract;
mod ingest;
mod llm;
mod migrate;
mod models;
mod retrieve;
mod sanitize;
mod server;
mod store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// knowbase, a self-hosted document ingestion and retrieval-augmented chat
/// service.
#[derive(Parser)]
#[command(
    name = "knowbase",
    about = "knowbase: upload documents into areas and chat with them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/knowbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP server (runs pending migrations first).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knowbase=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Serve => {
            server::run_server(config).await?;
        }
    }

    Ok(())
}
