//! Engine settings and logging configuration.

use serde::{Deserialize, Serialize};

use crate::sync::MAX_BATCH_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distinguishes this engine's persisted configuration databases
    /// (`sync_config<instance_key>`) from other instances on the same store.
    pub instance_key: String,
    /// Sleep after a successful sync pass, in milliseconds.
    pub sync_interval_ms: u64,
    /// Sleep after an unsuccessful sync pass, in milliseconds.
    pub backoff_interval_ms: u64,
    /// Byte bound on one committed batch of local writes.
    pub max_batch_bytes: usize,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_key: String::new(),
            sync_interval_ms: 500,
            backoff_interval_ms: 5_000,
            max_batch_bytes: MAX_BATCH_BYTES,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_instance_key(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    /// Log directory; defaults to the working directory when unset.
    pub dir: Option<std::path::PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_sync_cadence() {
        let config = EngineConfig::default();
        assert_eq!(config.sync_interval_ms, 500);
        assert_eq!(config.backoff_interval_ms, 5_000);
        assert_eq!(config.max_batch_bytes, MAX_BATCH_BYTES);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = EngineConfig::with_instance_key("k1");
        let doc = bson::to_document(&config).expect("encode");
        let back: EngineConfig = bson::from_document(doc).expect("decode");
        assert_eq!(back.instance_key, "k1");
        assert_eq!(back.max_batch_bytes, config.max_batch_bytes);
    }
}
