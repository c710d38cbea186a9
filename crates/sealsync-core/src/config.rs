//! Engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/sealsync/config.toml)
//! 3. Environment variables (SEALSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "SEALSYNC";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local state (SQLite database, key file)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Relay WebSocket URL (optional)
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Whether to talk to the relay at all
    #[serde(default)]
    pub sync_enabled: bool,

    /// Identity announced to the relay; deltas carrying it are ignored
    #[serde(default)]
    pub author_id: Option<String>,

    /// Encryption key file (defaults to `sync.key` in the data dir)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Log file for the CLI (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relay_url: None,
            sync_enabled: false,
            author_id: None,
            key_file: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SEALSYNC_DATA_DIR, SEALSYNC_RELAY_URL, ...)
    /// 2. Config file (~/.config/sealsync/config.toml or SEALSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from an explicit path when given, else the default location
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_RELAY_URL", ENV_PREFIX)) {
            self.relay_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_AUTHOR_ID", ENV_PREFIX)) {
            self.author_id = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_KEY_FILE", ENV_PREFIX)) {
            self.key_file = non_empty(val).map(PathBuf::from);
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single key by name, as used by `config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        let cleared = |v: String| if v == "none" { None } else { non_empty(v) };

        match key {
            "data_dir" => self.data_dir = value.into(),
            "relay_url" => self.relay_url = cleared(value),
            "sync_enabled" => {
                self.sync_enabled = value
                    .parse()
                    .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?
            }
            "author_id" => self.author_id = cleared(value),
            "key_file" => self.key_file = cleared(value).map(PathBuf::from),
            "log_file" => self.log_file = cleared(value).map(PathBuf::from),
            _ => anyhow::bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, relay_url, sync_enabled, author_id, key_file, log_file",
                key
            ),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SEALSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sealsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sealsync.db")
    }

    /// Get the path to the encryption key
    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sync.key"))
    }

    /// Relay URL, if syncing is switched on
    pub fn active_relay(&self) -> Option<&str> {
        if self.sync_enabled {
            self.relay_url.as_deref()
        } else {
            None
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sealsync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "SEALSYNC_DATA_DIR",
        "SEALSYNC_RELAY_URL",
        "SEALSYNC_SYNC_ENABLED",
        "SEALSYNC_AUTHOR_ID",
        "SEALSYNC_KEY_FILE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.relay_url.is_none());
        assert!(config.data_dir.ends_with("sealsync"));
    }

    #[test]
    fn test_file_paths() {
        let mut config = Config::default();

        assert!(config.database_path().ends_with("sealsync.db"));
        assert!(config.key_path().ends_with("sync.key"));

        config.key_file = Some(PathBuf::from("/secrets/doc.key"));
        assert_eq!(config.key_path(), PathBuf::from("/secrets/doc.key"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("SEALSYNC_DATA_DIR", "/tmp/sealsync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/sealsync-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        assert!(!config.sync_enabled);

        env::set_var("SEALSYNC_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("SEALSYNC_SYNC_ENABLED", "1");
        config.sync_enabled = false;
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("SEALSYNC_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_relay_url_and_author() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("SEALSYNC_RELAY_URL", "ws://localhost:3030");
        env::set_var("SEALSYNC_AUTHOR_ID", "laptop");
        config.apply_env_overrides();
        assert_eq!(config.relay_url, Some("ws://localhost:3030".to_string()));
        assert_eq!(config.author_id, Some("laptop".to_string()));

        // Empty string clears it
        env::set_var("SEALSYNC_RELAY_URL", "");
        config.apply_env_overrides();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_active_relay_requires_sync_enabled() {
        let mut config = Config {
            relay_url: Some("ws://relay".to_string()),
            ..Config::default()
        };
        assert_eq!(config.active_relay(), None);

        config.sync_enabled = true;
        assert_eq!(config.active_relay(), Some("ws://relay"));
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();

        config.set_value("relay_url", "ws://relay").unwrap();
        config.set_value("sync_enabled", "true").unwrap();
        config.set_value("author_id", "desk").unwrap();
        assert_eq!(config.relay_url.as_deref(), Some("ws://relay"));
        assert!(config.sync_enabled);
        assert_eq!(config.author_id.as_deref(), Some("desk"));

        config.set_value("relay_url", "none").unwrap();
        assert!(config.relay_url.is_none());

        assert!(config.set_value("sync_enabled", "maybe").is_err());
        assert!(config.set_value("favorite_color", "blue").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            relay_url: Some("ws://sync.example.com".to_string()),
            sync_enabled: true,
            author_id: Some("desk".to_string()),
            key_file: None,
            log_file: None,
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.relay_url, config.relay_url);
        assert_eq!(loaded.author_id, config.author_id);
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            relay_url = "ws://example.com"
            sync_enabled = true
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.relay_url, Some("ws://example.com".to_string()));
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("SEALSYNC_DATA_DIR", temp_dir.path().join("data"));

        let path = temp_dir.path().join("missing.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.relay_url.is_none());
    }
}
