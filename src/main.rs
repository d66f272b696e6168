#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use chatrelay::config::Config;
use chatrelay::history::{FileTurnStorage, HistoryStore};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

/// `chatrelay` - relay chat messages to a language model and back.
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "Relay chat messages to a language model and send the replies back.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay: connection, message pipeline, session monitor and gateway
    Daemon {
        /// Port to listen on (default: from config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (default: from config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Print the stored conversation for a chat
    History {
        /// Chat identifier, e.g. 15551234567@c.us
        chat_id: String,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Daemon { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            info!("🦀 Starting chatrelay daemon on {host}:{port}");
            chatrelay::daemon::run(config, host, port).await
        }

        Commands::History { chat_id } => {
            let store = HistoryStore::new(
                Arc::new(FileTurnStorage::new(config.history_dir())),
                config.history.max_turns,
            );
            let turns = store.load(&chat_id).await;
            if turns.is_empty() {
                println!("No history for {chat_id}.");
                return Ok(());
            }
            println!("{} turn(s) for {chat_id}:", turns.len());
            for turn in turns {
                println!(
                    "  [{}] {}",
                    turn.role.as_str(),
                    chatrelay::util::preview(&turn.content)
                );
            }
            Ok(())
        }

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}
