//! Configuration for charla
//!
//! Loaded from TOML. Every section falls back to its defaults, so an empty
//! file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use charla_document::document::{DocumentStoreConfig, IndexSpec};

use crate::error::{CharlaError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Extra indexes registered after the built-in catalog
    pub indexes: Vec<IndexSpec>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CharlaError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| CharlaError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.query_timeout.is_zero() {
            return Err(CharlaError::Config(
                "Query timeout cannot be 0".to_string(),
            ));
        }

        if self.store.max_document_size == 0 {
            return Err(CharlaError::Config(
                "Max document size cannot be 0".to_string(),
            ));
        }

        if self.store.max_nesting_depth == 0 {
            return Err(CharlaError::Config(
                "Max nesting depth cannot be 0".to_string(),
            ));
        }

        for spec in &self.indexes {
            if spec.name.is_empty() || spec.keys.is_empty() {
                return Err(CharlaError::Config(format!(
                    "Index on {} needs a name and at least one key",
                    spec.collection
                )));
            }
        }

        Ok(())
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum encoded document size in bytes
    pub max_document_size: usize,

    /// Maximum document nesting depth
    pub max_nesting_depth: usize,

    /// Deadline applied to every query (milliseconds)
    #[serde(rename = "query_timeout_ms", with = "millis_serde")]
    pub query_timeout: Duration,

    /// Log a warning when a filtered query falls back to a full scan
    pub warn_on_full_scan: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let defaults = DocumentStoreConfig::default();
        Self {
            max_document_size: defaults.max_document_size,
            max_nesting_depth: defaults.max_nesting_depth,
            query_timeout: Duration::from_millis(5000),
            warn_on_full_scan: defaults.warn_on_full_scan,
        }
    }
}

impl StoreConfig {
    /// Settings for the document store engine
    pub fn document_store(&self) -> DocumentStoreConfig {
        DocumentStoreConfig {
            max_document_size: self.max_document_size,
            max_nesting_depth: self.max_nesting_depth,
            warn_on_full_scan: self.warn_on_full_scan,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

/// Helper module for millisecond Duration serialization
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charla_document::document::Direction;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.query_timeout, Duration::from_millis(5000));
        assert_eq!(config.store.max_document_size, 16 * 1024 * 1024);
        assert_eq!(config.store.max_nesting_depth, 100);
        assert!(config.store.warn_on_full_scan);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.indexes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.store.query_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_config_from_str() {
        let toml = r#"
[store]
query_timeout_ms = 250
warn_on_full_scan = false

[logging]
level = "debug"
format = "json"

[[indexes]]
name = "by-sender-kind"
collection = "messages"
keys = [
    { field = "sender" },
    { field = "content.kind", direction = "desc" },
]
"#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.store.query_timeout, Duration::from_millis(250));
        assert!(!config.store.warn_on_full_scan);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let spec = &config.indexes[0];
        assert_eq!(spec.collection, "messages");
        assert_eq!(spec.keys[0].direction, Direction::Asc);
        assert_eq!(spec.keys[1].direction, Direction::Desc);
        assert!(!spec.unique);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = Config::parse_str("[store]\nquery_timeout_ms = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(CharlaError::Config(_))));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::parse_str("[store\nquery_timeout_ms = 1"),
            Err(CharlaError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charla.toml");
        std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.logging.level, "warn");

        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::from_file(&missing), Err(CharlaError::Config(_))));
    }
}
