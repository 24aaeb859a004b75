//! loaderkit CLI - drive lifecycle-aware loaders from the terminal

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loaderkit::config::Config;

mod commands;
mod logging;

use commands::{cmd_config_init, cmd_config_show, cmd_demo};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "loaderkit")]
#[command(about = "Lifecycle-aware background loaders")]
#[command(after_help = "\
QUICK START:
  loaderkit config init           # Write a default user config
  loaderkit demo                  # Run a simulated owner lifecycle
  loaderkit demo --throttle-ms 200 --loads 20")]
struct Cli {
  /// Config file (default: ~/.config/loaderkit/config.toml)
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Override the configured log level
  #[arg(long, global = true)]
  log_level: Option<String>,

  /// Also write logs to this file
  #[arg(long, global = true, value_name = "FILE")]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a simulated owner lifecycle against a throttled loader
  Demo {
    /// Minimum milliseconds between loads (default: [loader] update_throttle_ms)
    #[arg(long)]
    throttle_ms: Option<u64>,
    /// Number of content changes the producer makes
    #[arg(long, default_value = "10")]
    loads: u32,
  },
  /// Configuration management
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

/// Subcommands for `loaderkit config`
#[derive(Subcommand)]
enum ConfigCommand {
  /// Write the default config template to the user config path
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Show the effective configuration
  Show,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let mut config = Config::resolve(cli.config.as_deref())?;
  if let Some(level) = cli.log_level {
    config.logging.level = level;
  }
  if let Some(file) = cli.log_file {
    config.logging.file = Some(file);
  }

  let _guard = init_logging(&config.logging)?;

  match cli.command {
    Commands::Demo { throttle_ms, loads } => {
      let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.executor.max_blocking_threads.max(1))
        .thread_name(config.executor.thread_name.clone())
        .build()
        .context("Failed to build tokio runtime")?;
      runtime.block_on(cmd_demo(&config, throttle_ms, loads))
    }
    Commands::Config { command } => match command {
      ConfigCommand::Init { force } => cmd_config_init(force),
      ConfigCommand::Show => cmd_config_show(&config, cli.config.as_deref()),
    },
  }
}
