//! Configuration loading
//!
//! Settings files are TOML or RON, picked by file extension.

pub use serde::{Deserialize, Serialize};

mod renderer;

pub use renderer::{BuildPreference, HitGroupShaders, RayTracingShaderConfig, RendererConfig};

use std::path::Path;

/// On-disk settings format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.toml`
    Toml,
    /// `.ron`
    Ron,
}

impl ConfigFormat {
    /// Format named by the extension of `path`, ignoring case
    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let extension = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.to_string())),
        }
    }

    fn parse<T: for<'de> Deserialize<'de>>(self, path: &str, contents: &str) -> Result<T, ConfigError> {
        let result = match self {
            Self::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
            Self::Ron => ron::from_str(contents).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| ConfigError::Parse {
            path: path.to_string(),
            reason,
        })
    }

    fn render<T: Serialize>(self, value: &T) -> Result<String, ConfigError> {
        match self {
            Self::Toml => toml::to_string_pretty(value).map_err(|e| ConfigError::Serialize(e.to_string())),
            Self::Ron => ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string())),
        }
    }
}

/// Settings that round-trip through a TOML or RON file
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Read and parse `path`
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path)?;
        log::debug!("Parsing {:?} configuration from {}", format, path);
        format.parse(path, &contents)
    }

    /// Serialize to `path`, replacing any existing file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = ConfigFormat::from_path(path)?.render(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// File contents did not parse
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// File that failed
        path: String,
        /// Parser message
        reason: String,
    },

    /// Value could not be serialized
    #[error("failed to serialize configuration: {0}")]
    Serialize(String),

    /// Extension is neither `.toml` nor `.ron`
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Values parsed but failed validation
    #[error("invalid configuration: {0}")]
    Validation(String),
}
