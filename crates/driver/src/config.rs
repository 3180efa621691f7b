//! Simulator configuration.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config PATH`, else ~/.config/tokstep/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokstep_core::config::{DecoderConfig, DecoderKind};
use tokstep_core::request::SamplingConfig;
use tokstep_core::scheduler::SchedulerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Shape of the synthetic request stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub requests: usize,
    pub prompt_len: usize,
    pub max_new_tokens: usize,
    pub vocab_size: usize,
    /// Token ending a request early when produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_id: Option<u32>,
    /// Applied to every request. Only the mixed decoder honors top-k/top-p.
    pub sampling: SamplingConfig,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            requests: 8,
            prompt_len: 16,
            max_new_tokens: 32,
            vocab_size: 256,
            end_id: None,
            sampling: SamplingConfig::greedy(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub decoder: DecoderConfig,
    pub scheduler: SchedulerConfig,
    pub workload: WorkloadConfig,
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub decoder: Option<DecoderKind>,
    pub requests: Option<usize>,
    pub max_new_tokens: Option<usize>,
    pub vocab_size: Option<usize>,
    pub overlap: bool,
    pub seed: Option<u64>,
}

impl DriverConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tokstep").join("config.toml"))
    }

    /// Load from `path`, or from the default path when it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply command-line values on top of the loaded file.
    pub fn merge(&mut self, overrides: &Overrides) {
        if let Some(kind) = overrides.decoder {
            self.decoder.kind = kind;
        }
        if let Some(requests) = overrides.requests {
            self.workload.requests = requests;
        }
        if let Some(max_new_tokens) = overrides.max_new_tokens {
            self.workload.max_new_tokens = max_new_tokens;
        }
        if let Some(vocab_size) = overrides.vocab_size {
            self.workload.vocab_size = vocab_size;
        }
        if overrides.overlap {
            self.decoder.overlap = true;
        }
        if overrides.seed.is_some() {
            self.decoder.seed = overrides.seed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DriverConfig::default();
        config.decoder.kind = DecoderKind::Native;
        config.decoder.scratch_depth = 3;
        config.scheduler.enable_chunked_prefill = true;
        config.workload.end_id = Some(2);
        config.workload.sampling = SamplingConfig::top_k(5);

        config.save_to(&path).unwrap();
        let loaded = DriverConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[decoder]\nkind = \"mixed\"\n\n[workload]\nrequests = 3\n",
        )
        .unwrap();

        let loaded = DriverConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.decoder.kind, DecoderKind::Mixed);
        assert_eq!(loaded.decoder.max_seq_len, DecoderConfig::default().max_seq_len);
        assert_eq!(loaded.workload.requests, 3);
        assert_eq!(loaded.workload.vocab_size, 256);
        assert_eq!(loaded.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempdir().unwrap();
        let err = DriverConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_bad_kind_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[decoder]\nkind = \"beam\"\n").unwrap();
        assert!(matches!(
            DriverConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_merge() {
        let mut config = DriverConfig::default();
        config.decoder.seed = Some(1);
        config.workload.requests = 4;

        config.merge(&Overrides {
            decoder: Some(DecoderKind::StarAttention),
            max_new_tokens: Some(7),
            overlap: true,
            ..Default::default()
        });

        assert_eq!(config.decoder.kind, DecoderKind::StarAttention); // Overridden
        assert_eq!(config.workload.max_new_tokens, 7); // Overridden
        assert!(config.decoder.overlap);
        assert_eq!(config.decoder.seed, Some(1)); // Unchanged
        assert_eq!(config.workload.requests, 4); // Unchanged
    }
}
