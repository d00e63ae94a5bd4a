//! Engine configuration.
//!
//! Loaded from TOML; every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! buffer_count = 1024
//! buffer_size_bytes = 4096
//! number_of_workers = 2
//! layout = "row"
//!
//! [compiler]
//! pipelining = "fuse_if_possible"
//! backend = "interpreter"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::LayoutKind;

/// Smallest buffer that still holds one 8-byte field.
pub const MIN_BUFFER_SIZE: usize = 8;

/// Errors loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown values.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Pipelining policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeliningKind {
    /// Fuse stateless operators, break at blocking ones.
    #[default]
    FuseIfPossible,
    /// One operator per pipeline.
    AlwaysBreak,
}

/// Compiler backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Walks the pipeline IR per record.
    #[default]
    Interpreter,
    /// Pre-built closure chains.
    Closure,
}

/// `[compiler]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Pipelining policy.
    pub pipelining: PipeliningKind,
    /// Code generation backend.
    pub backend: BackendKind,
}

/// Configuration of a [`NodeEngine`](crate::runtime::NodeEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffers in the pool.
    pub buffer_count: usize,
    /// Size of each buffer in bytes.
    pub buffer_size_bytes: usize,
    /// Worker threads executing tasks.
    pub number_of_workers: usize,
    /// Record layout of every buffer the engine writes.
    pub layout: LayoutKind,
    /// Compiler settings.
    pub compiler: CompilerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1024,
            buffer_size_bytes: 4096,
            number_of_workers: 2,
            layout: LayoutKind::Row,
            compiler: CompilerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise see
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the pool and worker settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.buffer_count == 0 {
            return Err(invalid("buffer_count", "must be at least 1"));
        }
        if self.number_of_workers == 0 {
            return Err(invalid("number_of_workers", "must be at least 1"));
        }
        if self.buffer_size_bytes < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid {
                field: "buffer_size_bytes",
                reason: format!(
                    "{} is below the minimum of {MIN_BUFFER_SIZE} bytes",
                    self.buffer_size_bytes
                ),
            });
        }
        Ok(())
    }
}
