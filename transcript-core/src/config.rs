//! Configuration types for transcript writing and replay

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TranscriptError};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Writer configuration
    pub writer: WriterConfig,

    /// Reader configuration
    pub reader: ReaderConfig,
}

/// Writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Events held in memory before a batch is spilled to a bucket file.
    /// `0` keeps everything in memory.
    pub bucket_size: usize,

    /// Explicit scratch directory; must be empty. A private temporary
    /// directory is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            bucket_size: 50_000,
            working_dir: None,
        }
    }
}

/// Reader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Decoded moments buffered ahead of `next()`
    pub read_ahead: usize,

    /// Sleep between empty polls in `replay_all`
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Parent directory for the private extraction directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_ahead: 256,
            poll_interval: Duration::from_millis(5),
            working_dir: None,
        }
    }
}

impl TranscriptConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (`transcript.toml`)
    /// 3. Environment variable overrides (`TRANSCRIPT_READER__READ_AHEAD=64`)
    /// 4. Configuration file at `TRANSCRIPT_CONFIG_PATH`, if set
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(TranscriptConfig::default()))
            .merge(Toml::file("transcript.toml"))
            .merge(
                Env::prefixed("TRANSCRIPT_")
                    .ignore(&["CONFIG_PATH"])
                    .split("__"),
            );

        if let Ok(path) = std::env::var("TRANSCRIPT_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: TranscriptConfig = figment.extract().map_err(|e| {
            TranscriptError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: TranscriptConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                TranscriptError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reader.read_ahead == 0 {
            return Err(TranscriptError::Configuration(
                "reader.read_ahead must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = TranscriptConfig::default();
        assert_eq!(config.writer.bucket_size, 50_000);
        assert_eq!(config.reader.read_ahead, 256);
        assert_eq!(config.reader.poll_interval, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "transcript.toml",
                r#"
                [writer]
                bucket_size = 10

                [reader]
                poll_interval = "20ms"
                "#,
            )?;
            jail.set_env("TRANSCRIPT_READER__READ_AHEAD", "8");

            let config = TranscriptConfig::load().expect("config loads");
            assert_eq!(config.writer.bucket_size, 10);
            assert_eq!(config.reader.read_ahead, 8);
            assert_eq!(config.reader.poll_interval, Duration::from_millis(20));
            assert_eq!(config.writer.working_dir, None);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_read_ahead_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[reader]\nread_ahead = 0\n")?;
            let err = TranscriptConfig::from_file("custom.toml").unwrap_err();
            assert!(matches!(err, TranscriptError::Configuration(_)));
            Ok(())
        });
    }
}
