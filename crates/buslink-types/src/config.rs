//! Connection configuration loaded from `<config_dir>/buslink/config.toml`
//! with defaults.

use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Which bus to attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    #[default]
    Session,
}

/// Per-connection settings, owned by the connection and passed down to
/// every component built on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus to attach to.
    pub bus: BusKind,
    /// Well-known name to claim on connect.
    pub name: Option<String>,
    /// Take the name over from its current owner if that owner allows it.
    pub replace_existing: bool,
    /// Let a later claimant take the name from us.
    pub allow_replacement: bool,
    /// Wait in the queue for the name instead of failing.
    pub name_queue: bool,
    /// Default method call timeout in milliseconds.
    pub call_timeout_ms: u64,
    /// Ask the bus to filter signals with match rules.
    pub match_rules: bool,
    /// Derive bus member names from snake_case Rust names.
    pub camel_convert: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus: BusKind::Session,
            name: None,
            replace_existing: false,
            allow_replacement: false,
            name_queue: true,
            call_timeout_ms: 30_000,
            match_rules: true,
            camel_convert: true,
        }
    }
}

impl BusConfig {
    /// Config for a connection that claims `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Parse a TOML document.
pub fn parse_config(contents: &str) -> BusResult<BusConfig> {
    toml::from_str(contents).map_err(|e| BusError::Config(e.to_string()))
}

/// Load configuration from a TOML file, with defaults.
///
/// Missing or malformed files are logged and replaced by
/// [`BusConfig::default`].
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BusConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BusConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BusConfig::default()
        }
    }
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("buslink")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert!(config.match_rules);
        assert!(config.camel_convert);
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/buslink.toml")));
        assert_eq!(config, BusConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            bus = "system"
            name = "com.example.Calc"
            call_timeout_ms = 500
            match_rules = false
        "#,
        )
        .unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.name.as_deref(), Some("com.example.Calc"));
        assert_eq!(config.call_timeout(), Duration::from_millis(500));
        assert!(!config.match_rules);
        assert!(config.camel_convert);
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "call_timeout_ms = \"soon\"").unwrap();
        assert_eq!(load_config(Some(&path)), BusConfig::default());
    }

    #[test]
    fn test_parse_config_error() {
        assert!(matches!(
            parse_config("bus = \"tcp\""),
            Err(BusError::Config(_))
        ));
    }
}
