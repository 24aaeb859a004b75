//! Logging setup for the CLI

use std::path::Path;

use anyhow::{Context, Result};
use loaderkit::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::level_filters::LevelFilter {
  use tracing::level_filters::LevelFilter;
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize logging from config.
///
/// Console output always goes to stderr. When a log file is configured, a
/// second non-ANSI layer writes to it through a non-blocking appender; the
/// returned guard must be kept alive until exit so buffered lines get flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  // RUST_LOG wins over the configured level
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy();

  let console = fmt::layer().with_target(true).with_writer(std::io::stderr);

  let Some(file) = &config.file else {
    tracing_subscriber::registry().with(env_filter).with(console).init();
    return Ok(None);
  };

  let (dir, name) = split_log_path(file)?;
  std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {}", dir.display()))?;
  let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

  tracing_subscriber::registry()
    .with(env_filter)
    .with(console)
    .with(fmt::layer().with_target(true).with_ansi(false).with_writer(file_writer))
    .init();

  Ok(Some(guard))
}

fn split_log_path(file: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
  let name = file
    .file_name()
    .with_context(|| format!("Log file path has no file name: {}", file.display()))?;
  let dir = match file.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent,
    _ => Path::new("."),
  };
  Ok((dir, name))
}
