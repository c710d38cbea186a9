//! Init command handler

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use sealsync_core::{Config, EncryptionKey};

use crate::engine::write_key;
use crate::output::{Output, OutputFormat};

/// First-time setup: generate the key file and an author id
pub fn run(config_path: Option<&PathBuf>, author: Option<String>, output: &Output) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let key_path = config.key_path();

    if key_path.exists() && config.author_id.is_some() {
        output.message(&format!(
            "Already initialized as '{}'.\nTo start fresh, remove:\n  {}",
            config.author_id.as_deref().unwrap_or_default(),
            key_path.display()
        ));
        return Ok(());
    }

    if !key_path.exists() {
        write_key(&key_path, &EncryptionKey::generate())?;
    }
    let author_id = match (author, config.author_id.clone()) {
        (Some(author), _) => author,
        (None, Some(existing)) => existing,
        (None, None) => generate_author_id(),
    };
    config.author_id = Some(author_id.clone());

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&json!({
            "author_id": author_id,
            "key_file": key_path,
        })),
        OutputFormat::Quiet => println!("{}", author_id),
        OutputFormat::Human => {
            println!();
            println!("Initialized sealsync.");
            println!();
            println!("Author ID: {}", author_id);
            println!("Key file:  {}", key_path.display());
            println!();
            println!("Copy the key file to every device that shares your documents.");
            if config.relay_url.is_none() {
                println!("Relay not configured. Your data will sync once you set one:");
                println!("  sealsync config set relay_url ws://your-relay:3030");
                println!("  sealsync config set sync_enabled true");
            }
        }
    }

    Ok(())
}

fn generate_author_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("device-{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::load_key;
    use tempfile::TempDir;

    #[test]
    fn test_generate_author_id() {
        let a = generate_author_id();
        assert!(a.starts_with("device-"));
        assert_eq!(a.len(), "device-".len() + 12);
        assert_ne!(a, generate_author_id());
    }

    #[test]
    fn test_init_writes_key_and_author() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        Config {
            data_dir: temp_dir.path().join("data"),
            ..Config::default()
        }
        .save_to_path(&config_path)
        .unwrap();
        let output = Output::new(OutputFormat::Quiet);

        run(Some(&config_path), Some("laptop".to_string()), &output).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        assert_eq!(config.author_id.as_deref(), Some("laptop"));
        let key = load_key(&config.key_path()).unwrap();

        // Second run keeps the existing key
        run(Some(&config_path), None, &output).unwrap();
        assert_eq!(load_key(&config.key_path()).unwrap().as_bytes(), key.as_bytes());
    }
}
