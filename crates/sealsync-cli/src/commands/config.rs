//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use sealsync_core::Config;

use crate::output::{Output, OutputFormat};

fn display_path(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            output.json(&json!({
                "data_dir": config.data_dir,
                "relay_url": config.relay_url,
                "sync_enabled": config.sync_enabled,
                "author_id": config.author_id,
                "key_file": config.key_path(),
                "log_file": config.log_file
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:     {}", config.data_dir.display());
            println!(
                "  relay_url:    {}",
                config.relay_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled: {}", config.sync_enabled);
            println!(
                "  author_id:    {}",
                config.author_id.as_deref().unwrap_or("(not set)")
            );
            println!("  key_file:     {}", config.key_path().display());
            println!("  log_file:     {}", display_path(config.log_file.as_ref()));
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    config.set_value(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_persists_to_cli_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        Config {
            data_dir: temp_dir.path().join("data"),
            ..Config::default()
        }
        .save_to_path(&path)
        .unwrap();
        let output = Output::new(OutputFormat::Quiet);

        set(
            "relay_url".to_string(),
            "ws://relay:3030".to_string(),
            Some(&path),
            &output,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.relay_url.as_deref(), Some("ws://relay:3030"));
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        Config {
            data_dir: temp_dir.path().join("data"),
            ..Config::default()
        }
        .save_to_path(&path)
        .unwrap();
        let before = std::fs::read_to_string(&path).unwrap();
        let output = Output::new(OutputFormat::Quiet);

        let err = set("colour".to_string(), "red".to_string(), Some(&path), &output).unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }
}
