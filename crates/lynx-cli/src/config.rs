//! `lynx.toml` loading.
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [fleet]
//! global_concurrency_cap = 32
//!
//! [[agents]]
//! name = "db-1"
//! capabilities = ["database"]
//! max_concurrency = 2
//! ```

use anyhow::Context;
use lynx_fleet::{AgentRequest, FleetConfig};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct LynxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    /// Agents registered at startup.
    #[serde(default)]
    pub agents: Vec<AgentRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl LynxConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.fleet.validate()?;
        Ok(config)
    }

    /// Read `path`, or fall back to defaults when `optional` and the file
    /// does not exist.
    pub fn load(path: &Path, optional: bool) -> anyhow::Result<Self> {
        if optional && !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = LynxConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.fleet.default_max_attempts, 3);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_full_document() {
        let config = LynxConfig::from_toml_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 8080

            [fleet]
            global_concurrency_cap = 4
            default_deadline_ms = 5000

            [fleet.retry]
            backoff_base_ms = 50

            [[agents]]
            name = "db-1"
            capabilities = ["Database", "backend"]
            max_concurrency = 2

            [[agents]]
            capabilities = ["testing"]
            max_concurrency = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.fleet.global_concurrency_cap, 4);
        assert_eq!(config.fleet.default_deadline_ms, Some(5000));
        assert_eq!(config.fleet.retry.backoff_base_ms, 50);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].name.as_deref(), Some("db-1"));
        assert_eq!(config.agents[0].capabilities[0].as_str(), "database");
    }

    #[test]
    fn test_invalid_fleet_rejected() {
        let err = LynxConfig::from_toml_str("[fleet]\nglobal_concurrency_cap = 0\n").unwrap_err();
        assert!(err.to_string().contains("global_concurrency_cap"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 4100").unwrap();
        let config = LynxConfig::load(file.path(), false).unwrap();
        assert_eq!(config.server.port, 4100);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(LynxConfig::load(&path, false).is_err());
        let config = LynxConfig::load(&path, true).unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
