//! Engine tuning knobs.
//!
//! Every field has a default, so a configuration file only needs to name the
//! values it changes:
//!
//! ```toml
//! retry_delay_ms = 250
//! shutdown_grace_ms = 500
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of queued tasks the worker takes per iteration.
    pub write_batch: usize,
    /// Pause between connection attempts of the frame role.
    pub retry_delay_ms: u64,
    /// How long `stop` lets queued writes flush before cancelling the worker.
    pub shutdown_grace_ms: u64,
    /// Largest payload accepted in either direction.
    pub max_payload_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_batch: 10,
            retry_delay_ms: 100,
            shutdown_grace_ms: 1000,
            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        toml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Load the user configuration file if there is one, defaults otherwise.
    pub fn load_default() -> Result<Self, EngineError> {
        match default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading engine configuration");
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// `<config dir>/remotedbg/engine.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remotedbg").join("engine.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml_str("retry_delay_ms = 250\n").unwrap();

        assert_eq!(config.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.write_batch, EngineConfig::default().write_batch);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "write_batch = 4\nshutdown_grace_ms = 20").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.write_batch, 4);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(20));
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let result = EngineConfig::from_toml_str("write_batch = \"lots\"");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
