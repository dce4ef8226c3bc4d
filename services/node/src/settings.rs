//! Node settings: TOML file, `EMSG__` environment overrides, then CLI flags

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use emsg_network::{CommunicatorConfig, EndpointConfig, Role};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET: &str = "/tmp/emsg/node.sock";

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_endpoint")]
    pub endpoint: EndpointConfig,
    /// Text messages a slave sends before leaving
    #[serde(default = "default_messages")]
    pub messages: u64,
    /// Master wait bound for slaves on shutdown, in milliseconds
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
}

fn default_endpoint() -> EndpointConfig {
    EndpointConfig::unix(PathBuf::from(DEFAULT_SOCKET))
}

fn default_messages() -> u64 {
    10
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            role: Role::default(),
            endpoint: default_endpoint(),
            messages: default_messages(),
            shutdown_timeout_ms: None,
        }
    }
}

impl NodeSettings {
    /// Load from an optional file with environment overrides
    ///
    /// `EMSG__ROLE=master` or `EMSG__ENDPOINT__PATH=/tmp/x.sock` override
    /// the matching keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("EMSG")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize node configuration")
    }

    pub fn communicator(&self) -> CommunicatorConfig {
        CommunicatorConfig::new(self.role, self.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let settings = NodeSettings::default();
        assert_eq!(settings.role, Role::Slave);
        assert_eq!(settings.endpoint, EndpointConfig::unix(DEFAULT_SOCKET));
        assert_eq!(settings.messages, 10);
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "role = \"master\"\nmessages = 3\n\n[endpoint]\ntransport = \"inet\"\nhostname = \"127.0.0.1\"\nport = 7400"
        )
        .unwrap();

        let settings = NodeSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.role, Role::Master);
        assert_eq!(settings.messages, 3);
        assert_eq!(settings.endpoint, EndpointConfig::inet("127.0.0.1", 7400));
        assert!(settings.communicator().role.is_master());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(NodeSettings::load(Some(Path::new("/nonexistent/emsg.toml"))).is_err());
    }
}
