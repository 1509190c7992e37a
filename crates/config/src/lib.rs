//! Configuration schema and loader for the repstore read coordinator.

use repstore_common::ConsistencyLevel;
use serde::{Deserialize, Serialize};

/// Tuning knobs for replicated reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Consistency level applied when the caller does not pick one.
    #[serde(default = "default_level")]
    pub default_level: ConsistencyLevel,

    /// Deadline for the read fan-out phase, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Deadline for each repair phase (re-fetch, overwrite), in milliseconds.
    #[serde(default = "default_repair_timeout_ms")]
    pub repair_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            default_level: default_level(),
            read_timeout_ms: default_read_timeout_ms(),
            repair_timeout_ms: default_repair_timeout_ms(),
        }
    }
}

// --- Defaults ---

fn default_level() -> ConsistencyLevel {
    ConsistencyLevel::Quorum
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_repair_timeout_ms() -> u64 {
    10_000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ReplicationConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be > 0".into()));
        }
        if self.repair_timeout_ms == 0 {
            return Err(ConfigError::Invalid("repair_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Load a `ReplicationConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<ReplicationConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `ReplicationConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<ReplicationConfig, ConfigError> {
    let config: ReplicationConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = load_from_str("{}").unwrap();
        assert_eq!(config.default_level, ConsistencyLevel::Quorum);
        assert_eq!(config.read_timeout_ms, 5000);
        assert_eq!(config.repair_timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
default_level: ALL
read_timeout_ms: 1500
repair_timeout_ms: 4000
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.default_level, ConsistencyLevel::All);
        assert_eq!(config.read_timeout_ms, 1500);
        assert_eq!(config.repair_timeout_ms, 4000);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = load_from_str("default_level: ONE").unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.default_level, config2.default_level);
        assert_eq!(config.read_timeout_ms, config2.read_timeout_ms);
    }

    #[test]
    fn test_rejects_unknown_level() {
        let result = load_from_str("default_level: TWO");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_read_timeout() {
        let result = load_from_str("read_timeout_ms: 0");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(
            err.contains("read_timeout_ms"),
            "error should mention read_timeout_ms: {}",
            err
        );
    }

    #[test]
    fn test_rejects_zero_repair_timeout() {
        let result = load_from_str("repair_timeout_ms: 0");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(
            err.contains("repair_timeout_ms"),
            "error should mention repair_timeout_ms: {}",
            err
        );
    }
}
