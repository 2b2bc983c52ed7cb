//! Parley CLI — the main entry point.
//!
//! Commands:
//! - `serve`        — Start the HTTP gateway
//! - `ask`          — Answer one question from the terminal
//! - `ingest`       — Add documents to the retrieval index
//! - `tools`        — List the tools the model can call
//! - `serve-tools`  — Serve the built-in tools over stdio
//! - `token`        — Issue a session token for local testing
//! - `config`       — Show, locate or validate configuration

use clap::{Parser, Subcommand};
use parley_config::AppConfig;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley — authenticated conversational pipeline with remote tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.parley/config.toml)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask one question
    Ask {
        question: String,

        /// Session token to act with
        #[arg(long, env = "PARLEY_TOKEN", conflicts_with = "user")]
        token: Option<String>,

        /// Mint a session for this user instead of passing --token
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Add documents from a JSON file to the retrieval index
    Ingest { file: PathBuf },

    /// List local and remote tools
    Tools,

    /// Serve the built-in tools as a JSON-RPC provider on stdin/stdout
    ServeTools {
        /// Audience caller tokens must be addressed to
        #[arg(long, default_value = "authserver")]
        audience: String,
    },

    /// Issue a session token signed with the configured secret
    Token {
        user: String,

        /// Space-separated scopes
        #[arg(long, default_value = "openid profile")]
        scopes: String,

        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the default config file path
    Path,
    /// Validate the configuration
    Validate,
    /// Print a default config file
    Init,
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    config.map_err(|e| format!("Failed to load config: {e}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout belongs to the protocol under serve-tools
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Config { action: ConfigAction::Path } => commands::config_cmd::path(config_path),
        Commands::Config { action: ConfigAction::Init } => commands::config_cmd::init(),
        Commands::Config { action: ConfigAction::Validate } => commands::config_cmd::validate(config_path),
        Commands::Config { action: ConfigAction::Show } => {
            commands::config_cmd::show(&load_config(config_path)?)
        }
        Commands::Serve { port } => commands::serve::run(load_config(config_path)?, port).await,
        Commands::Ask { question, token, user } => {
            commands::ask::run(load_config(config_path)?, &question, token, user).await
        }
        Commands::Ingest { file } => commands::ingest::run(&load_config(config_path)?, &file).await,
        Commands::Tools => commands::tools::run(load_config(config_path)?).await,
        Commands::ServeTools { audience } => {
            commands::serve_tools::run(&load_config(config_path)?, &audience).await
        }
        Commands::Token { user, scopes, ttl_minutes } => {
            commands::token::run(&load_config(config_path)?, &user, &scopes, ttl_minutes)
        }
    }
}
