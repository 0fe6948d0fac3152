//! Queue configuration via `tributary.toml`
//!
//! A pipeline directory may carry a `tributary.toml` with the region sizes and
//! growth policy shared by every log in it. Missing keys fall back to the
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tributary_core::{Error, Result};
use tributary_storage::{GrowthPolicy, MIN_REGION_SIZE};

/// Config file name placed in a queue directory.
pub const CONFIG_FILE_NAME: &str = "tributary.toml";

const MB: u64 = 1024 * 1024;

/// Layout of the two backing files of one log.
///
/// # Example
///
/// ```toml
/// message_region_size = 4194304
/// index_region_size = 1048576
///
/// [growth]
/// min_file_size = 4194304
/// max_growth = 67108864
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Region size of the message stream (default: 4MB)
    #[serde(default = "default_message_region_size")]
    pub message_region_size: u64,
    /// Region size of the index stream (default: 1MB)
    #[serde(default = "default_index_region_size")]
    pub index_region_size: u64,
    /// Backing file growth policy
    #[serde(default)]
    pub growth: GrowthPolicy,
}

fn default_message_region_size() -> u64 {
    4 * MB
}

fn default_index_region_size() -> u64 {
    MB
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            message_region_size: default_message_region_size(),
            index_region_size: default_index_region_size(),
            growth: GrowthPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Small regions and files, so tests cross region boundaries quickly.
    pub fn for_testing() -> Self {
        QueueConfig {
            message_region_size: MIN_REGION_SIZE,
            index_region_size: MIN_REGION_SIZE,
            growth: GrowthPolicy {
                min_file_size: 4 * MIN_REGION_SIZE,
                max_growth: MB,
            },
        }
    }

    /// Set the message stream region size
    pub fn with_message_region_size(mut self, size: u64) -> Self {
        self.message_region_size = size;
        self
    }

    /// Set the index stream region size
    pub fn with_index_region_size(mut self, size: u64) -> Self {
        self.index_region_size = size;
        self
    }

    /// Set the growth policy
    pub fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.growth.validate()?;
        for (name, size) in [
            ("message_region_size", self.message_region_size),
            ("index_region_size", self.index_region_size),
        ] {
            if !size.is_power_of_two() || size < MIN_REGION_SIZE {
                return Err(Error::InvalidConfig(format!(
                    "{} ({}) must be a power of two of at least {}",
                    name, size, MIN_REGION_SIZE
                )));
            }
            if size > self.growth.max_growth {
                return Err(Error::InvalidConfig(format!(
                    "{} ({}) must not exceed growth.max_growth ({})",
                    name, size, self.growth.max_growth
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: QueueConfig = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, or return the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::InvalidConfig(msg) => {
                Error::InvalidConfig(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Serialize this config to TOML and write it to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tributary queue configuration
#
# Region sizes must be powers of two, at least 65536 bytes and no larger
# than growth.max_growth.
message_region_size = 4194304
index_region_size = 1048576

# Backing files start at min_file_size, double until max_growth,
# then grow by max_growth at a time.
[growth]
min_file_size = 4194304
max_growth = 67108864
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.message_region_size, 4 * MB);
        assert_eq!(config.index_region_size, MB);
        config.validate().unwrap();
        QueueConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn default_toml_matches_default() {
        let config = QueueConfig::from_toml_str(QueueConfig::default_toml()).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn missing_keys_use_defaults() {
        let config = QueueConfig::from_toml_str("index_region_size = 65536").unwrap();
        assert_eq!(config.index_region_size, 65536);
        assert_eq!(config.message_region_size, 4 * MB);
        assert_eq!(config.growth, GrowthPolicy::default());
    }

    #[test]
    fn invalid_region_size_rejected() {
        let err = QueueConfig::from_toml_str("message_region_size = 100000").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let too_big = QueueConfig::default().with_message_region_size(128 * MB);
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn unparsable_toml_rejected() {
        assert!(QueueConfig::from_toml_str("message_region_size = \"big\"").is_err());
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = QueueConfig::for_testing().with_index_region_size(2 * MIN_REGION_SIZE);
        config.write_to_file(&path).unwrap();
        assert_eq!(QueueConfig::load(&path).unwrap(), config);
    }
}
