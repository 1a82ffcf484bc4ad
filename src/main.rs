//! Charla - chat analytics over an indexed document store
//!
//! Loads fixtures into an in-memory store and prints query results as JSON.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use charla::chat::{ChatStore, Fixtures};
use charla::config::{Config, LogFormat};
use tracing::{debug, error};

/// Charla - chat analytics over an indexed document store
#[derive(Parser, Debug)]
#[command(name = "charla")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// JSON file of chats and messages to load first
    #[arg(
        short = 'f',
        long = "fixtures",
        value_name = "FILE",
        env = "CHARLA_FIXTURES",
        global = true
    )]
    fixtures: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "CHARLA_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,

    /// Query timeout in milliseconds (overrides config file)
    #[arg(long = "timeout-ms", value_name = "MILLIS", global = true)]
    timeout_ms: Option<u64>,

    /// Dump effective configuration to stdout and exit
    #[arg(long = "dump-config", action = ArgAction::SetTrue, global = true)]
    dump_config: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Public messages of a chat, oldest first
    Timeline {
        /// Chat id
        chat: String,
    },

    /// Participant with the most messages in a chat
    TopSender {
        /// Chat id
        chat: String,
    },

    /// Private messages a participant sent or received in a chat
    Thread {
        /// Chat id
        chat: String,
        /// Participant alias
        alias: String,
    },

    /// Registered indexes and their statistics
    Indexes,
}

impl Cli {
    fn apply_to_config(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(millis) = self.timeout_ms {
            config.store.query_timeout = Duration::from_millis(millis);
        }
    }
}

fn load_config(cli: &Cli) -> charla::Result<Config> {
    if let Some(path) = &cli.config {
        return Config::from_file(path);
    }

    let default_path = PathBuf::from("charla.toml");
    if default_path.exists() {
        return Config::from_file(&default_path);
    }

    Ok(Config::default())
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Results go to stdout, so logs go to stderr
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply_to_config(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    if cli.dump_config {
        return match toml::to_string_pretty(&config) {
            Ok(output) => {
                print!("{output}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: failed to serialize configuration: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    init_logging(&config);

    match run(&cli, &config).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: &Config) -> charla::Result<String> {
    let store = ChatStore::open(config).await?;

    if let Some(path) = &cli.fixtures {
        debug!(path = %path.display(), "loading fixtures");
        let fixtures = Fixtures::from_file(path)?;
        store.load_fixtures(&fixtures).await?;
    }

    let analytics = store.analytics();
    let output = match &cli.command {
        Commands::Timeline { chat } => {
            serde_json::to_string_pretty(&analytics.public_timeline(chat).await?)?
        }
        Commands::TopSender { chat } => {
            serde_json::to_string_pretty(&analytics.most_active_sender(chat).await?)?
        }
        Commands::Thread { chat, alias } => {
            serde_json::to_string_pretty(&analytics.private_thread(chat, alias).await?)?
        }
        Commands::Indexes => serde_json::to_string_pretty(&store.index_stats().await?)?,
    };

    Ok(output)
}
