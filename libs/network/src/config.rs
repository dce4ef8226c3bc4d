//! Communicator configuration
//!
//! A communicator needs a role and an endpoint. Three equivalent sources:
//!
//! - key/value pairs: `socket`, `hostname`, `port`, `role`
//! - the string form `unix:<path>` or `inet:<host>:<port>`
//! - TOML:
//!
//! ```toml
//! role = "master"
//! [endpoint]
//! transport = "unix"
//! path = "/tmp/emsg.sock"
//! ```
//!
//! Unknown keys are logged and ignored; an unparsable value leaves the
//! default in place.

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Peer role on a communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens, accepts slaves and assigns ids
    Master,
    /// Connects to a master
    #[default]
    Slave,
}

impl Role {
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

impl FromStr for Role {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(TransportError::configuration(
                format!("unknown role '{}', expected master or slave", other),
                Some("role"),
            )),
        }
    }
}

/// Where a communicator binds or connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum EndpointConfig {
    /// Unix-domain socket path
    Unix { path: PathBuf },
    /// TCP host and port
    Inet { hostname: String, port: u16 },
}

impl EndpointConfig {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        EndpointConfig::Unix { path: path.into() }
    }

    pub fn inet(hostname: impl Into<String>, port: u16) -> Self {
        EndpointConfig::Inet {
            hostname: hostname.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointConfig::Unix { path } => write!(f, "unix:{}", path.display()),
            EndpointConfig::Inet { hostname, port } => write!(f, "inet:{}:{}", hostname, port),
        }
    }
}

impl FromStr for EndpointConfig {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s.split_once(':').ok_or_else(|| {
            TransportError::configuration(
                format!("endpoint '{}' must start with unix: or inet:", s),
                Some("endpoint"),
            )
        })?;
        match scheme {
            "unix" if !rest.is_empty() => Ok(EndpointConfig::unix(rest)),
            "inet" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                    TransportError::configuration(
                        format!("inet endpoint '{}' needs host:port", rest),
                        Some("endpoint"),
                    )
                })?;
                let port = port.parse::<u16>().map_err(|_| {
                    TransportError::configuration(format!("invalid port '{}'", port), Some("port"))
                })?;
                if host.is_empty() {
                    return Err(TransportError::configuration("empty hostname", Some("hostname")));
                }
                Ok(EndpointConfig::inet(host, port))
            }
            _ => Err(TransportError::configuration(
                format!("unsupported endpoint '{}'", s),
                Some("endpoint"),
            )),
        }
    }
}

/// Role plus endpoint for one communicator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicatorConfig {
    #[serde(default)]
    pub role: Role,
    pub endpoint: EndpointConfig,
}

impl CommunicatorConfig {
    pub fn new(role: Role, endpoint: EndpointConfig) -> Self {
        Self { role, endpoint }
    }

    /// Build from key/value pairs
    ///
    /// `socket` selects a Unix endpoint; `hostname` and `port` an Inet one.
    /// Unknown keys and unparsable values are logged and skipped. Fails only
    /// if no endpoint can be formed.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut role = Role::default();
        let mut socket: Option<PathBuf> = None;
        let mut hostname: Option<String> = None;
        let mut port: Option<u16> = None;

        for (key, value) in pairs {
            match key {
                "socket" => socket = Some(PathBuf::from(value)),
                "hostname" => hostname = Some(value.to_string()),
                "port" => match value.parse::<u16>() {
                    Ok(p) => port = Some(p),
                    Err(_) => warn!(key, value, "Ignoring invalid port"),
                },
                "role" => match value.parse::<Role>() {
                    Ok(r) => role = r,
                    Err(e) => warn!(key, value, error = %e, "Ignoring invalid role"),
                },
                _ => warn!(key, value, "Ignoring unknown configuration key"),
            }
        }

        let endpoint = match (socket, hostname, port) {
            (Some(path), _, _) => EndpointConfig::Unix { path },
            (None, Some(hostname), Some(port)) => EndpointConfig::Inet { hostname, port },
            (None, None, Some(port)) if role.is_master() => EndpointConfig::inet("0.0.0.0", port),
            _ => {
                return Err(TransportError::configuration(
                    "no endpoint: set 'socket', or 'hostname' and 'port'",
                    None,
                ))
            }
        };

        Ok(Self { role, endpoint })
    }

    /// Parse the TOML form
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TransportError::configuration(format!("invalid TOML: {}", e), None))
    }
}
