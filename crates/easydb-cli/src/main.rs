//! EasyDB CLI
//!
//! Command-line interface for EasyDB - run the document server or work with
//! the document on a running one.

use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use easydb_core::{Config, Fingerprint};

mod commands;
mod output;

use commands::serve::ServeOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "easydb")]
#[command(about = "EasyDB - a shared JSON document kept in sync with JSON patches")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Server URL, including the base path
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the document server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// File the document is persisted to
        #[arg(long)]
        data_file: Option<PathBuf>,
        /// Path prefix for the endpoints
        #[arg(long)]
        base_path: Option<String>,
        /// Include error detail in failed responses
        #[arg(long)]
        debug: bool,
    },
    /// Print the document
    Get {
        /// JSON pointer to a part of the document (e.g. /m/user)
        pointer: Option<String>,
    },
    /// Replace the whole document
    Set {
        /// Document as JSON, or @path to read it from a file
        data: String,
    },
    /// Apply a JSON patch
    Patch {
        /// Patch operations as JSON, or @path to read them from a file
        ops: String,
        /// Reject the patch unless the server document has this fingerprint
        #[arg(long)]
        previous_hash: Option<Fingerprint>,
    },
    /// Follow changes to the document until interrupted
    Watch,
    /// Print the fingerprint of a JSON value
    Hash {
        /// Value as JSON, or @path to read it from a file
        data: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_file, bind, server_url, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work on the file as written, without env or flags
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let mut config = Config::load_with_cli_override(config_path)?;
    if let Some(url) = cli.url {
        config.server_url = url;
    }
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve {
            bind,
            data_file,
            base_path,
            debug,
        } => {
            let options = ServeOptions {
                bind,
                data_file,
                base_path,
                debug,
            };
            commands::serve::run(config, options, &output).await
        }
        Commands::Get { pointer } => commands::document::get(&config, pointer, &output).await,
        Commands::Set { data } => commands::document::set(&config, &data, &output).await,
        Commands::Patch { ops, previous_hash } => {
            commands::document::patch(&config, &ops, previous_hash, &output).await
        }
        Commands::Watch => commands::watch::run(&config, &output).await,
        Commands::Hash { data } => commands::document::hash(&data, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Set up tracing
///
/// RUST_LOG wins when set. Otherwise the level comes from `-v` or the
/// configured `log_level`. Logs go to `log_file` when configured, else stderr.
fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("easydb_core={},easydb_cli={}", level, level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Initialization errors are ignored; a subscriber may already be set
    let Some(log_path) = &config.log_file else {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match File::create(log_path) {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
            info!("Logging to {:?}", log_path);
        }
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
