//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use duet_core::config;
use duet_core::core::interrupt;

use crate::logging;

mod commands;

#[derive(Parser)]
#[command(name = "duet")]
#[command(version = "0.1")]
#[command(about = "Two chat sessions that talk to each other")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Send a prompt to a session and stream the replies
    Chat(commands::chat::ChatArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// List pooled API keys and their health
    Keys,
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Save the auto-reply delay, in minutes
    SetDelay {
        #[arg(value_name = "MINUTES")]
        minutes: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    interrupt::init()?;

    let config = config::Config::load().context("load config")?;
    let _log_guard = logging::init(&config.logging).context("init logging")?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli, config).await })
}

async fn dispatch(cli: Cli, config: config::Config) -> Result<()> {
    match cli.command {
        Commands::Chat(args) => commands::chat::run(args, config).await,
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::SetDelay { minutes } => commands::config::set_delay(&minutes),
        },
        Commands::Keys => commands::keys::run(&config).await,
    }
}
