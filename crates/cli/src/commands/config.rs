use std::path::Path;

use anyhow::{Context, Result, bail};
use loaderkit::config::Config;

/// Show the effective configuration and where it came from
pub fn cmd_config_show(config: &Config, explicit: Option<&Path>) -> Result<()> {
  match (explicit, Config::user_config_path()) {
    (Some(path), _) => println!("Using config: {}", path.display()),
    (None, Some(user_path)) if user_path.exists() => println!("Using user config: {}", user_path.display()),
    _ => println!("Using default configuration (no config file found)"),
  }
  println!();
  println!("{}", config.to_toml()?);
  Ok(())
}

/// Write the default template to the user config path
pub fn cmd_config_init(force: bool) -> Result<()> {
  let path = Config::user_config_path().context("Could not determine user config path")?;
  if path.exists() && !force {
    bail!("Config file already exists: {} (use --force to overwrite)", path.display());
  }
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&path, Config::generate_template())?;
  println!("Wrote default config: {}", path.display());
  Ok(())
}
