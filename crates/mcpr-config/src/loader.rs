//! Config file loading.

use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::GatewayConfig;
use crate::validate;

/// Result alias for config loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Config loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for the expected shape.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load and validate configuration from `path`.
pub fn load(path: impl AsRef<Path>) -> ConfigResult<GatewayConfig> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mut config: GatewayConfig = toml::from_str(&content)?;
    apply_env_overrides(&mut config);
    validate::validate(&config).map_err(ConfigError::Invalid)?;
    debug!(path = %path.as_ref().display(), servers = config.servers.len(), "config loaded");
    Ok(config)
}

/// Load from `path` when it exists, defaults otherwise.
pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<GatewayConfig> {
    if path.as_ref().exists() {
        load(path)
    } else {
        info!(path = %path.as_ref().display(), "no config file, using defaults");
        let mut config = GatewayConfig::default();
        apply_env_overrides(&mut config);
        Ok(config)
    }
}

/// `LOG_LEVEL` overrides the configured level. This is the only
/// environment knob; secrets never come from the environment.
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        if !level.is_empty() {
            config.log_level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
log_level = "debug"

[http]
port = 9999
allowed_origins = ["http://localhost:3000"]

[supervisor]
max_restarts = 3

[servers.filesystem]
command = "mcp-server-filesystem"
args = ["/tmp"]
auto_start = true

[servers.remote]
transport = "sse"
url = "http://localhost:9000/sse"
"#
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.http.port, 9999);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.supervisor.max_restarts, 3);
        // Unset supervisor fields keep their defaults.
        assert_eq!(config.supervisor.max_backoff_ms, 30_000);
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers["filesystem"].auto_start);
    }

    #[test]
    fn test_missing_file_defaults() {
        let config = load_or_default("/definitely/not/a/real/path.toml").unwrap();
        assert_eq!(config.http.port, 8787);
    }

    #[test]
    fn test_malformed_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "http = \"not a table\"").unwrap();
        assert!(matches!(load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[supervisor]
backoff_multiplier = 0.5
"#
        )
        .unwrap();
        assert!(matches!(load(file.path()), Err(ConfigError::Invalid(_))));
    }
}
