//! Where the controller lives on the network.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the controller firmware serves its WebSocket on.
pub const DEFAULT_PORT: u16 = 81;

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint host is empty")]
    EmptyHost,
    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
}

/// A host/port pair identifying the target device.
///
/// Immutable once a connection attempt begins: the connection manager keeps
/// its own copy and never edits it in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on the default controller port.
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PORT)
    }

    /// The WebSocket URL for this endpoint, e.g. `ws://192.168.1.100:81/`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for DeviceEndpoint {
    type Err = EndpointError;

    /// Parses `host` or `host:port`; a missing port means [`DEFAULT_PORT`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_port(s, DEFAULT_PORT)
    }
}

impl DeviceEndpoint {
    /// Parses `host` or `host:port`, using `default_port` when none is given.
    ///
    /// A leading `ws://` and a trailing `/` are accepted so a URL copied from
    /// a browser console parses too.
    pub fn parse_with_port(s: &str, default_port: u16) -> Result<Self, EndpointError> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix("ws://").unwrap_or(trimmed);
        let trimmed = trimmed.trim_end_matches('/');

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
                (host, port)
            }
            None => (trimmed, default_port),
        };

        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        Ok(Self::new(host, port))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only_uses_default_port() {
        let ep: DeviceEndpoint = "192.168.1.100".parse().unwrap();
        assert_eq!(ep, DeviceEndpoint::new("192.168.1.100", 81));
    }

    #[test]
    fn test_parse_host_and_port() {
        let ep: DeviceEndpoint = "tank.local:8081".parse().unwrap();
        assert_eq!(ep.host, "tank.local");
        assert_eq!(ep.port, 8081);
    }

    #[test]
    fn test_parse_with_port_applies_given_default() {
        let bare = DeviceEndpoint::parse_with_port("192.168.1.100", 8081).unwrap();
        let explicit = DeviceEndpoint::parse_with_port("192.168.1.100:81", 8081).unwrap();
        assert_eq!(bare.port, 8081);
        assert_eq!(explicit.port, 81);
    }

    #[test]
    fn test_parse_accepts_ws_url() {
        let ep: DeviceEndpoint = "ws://192.168.4.1:81/".parse().unwrap();
        assert_eq!(ep, DeviceEndpoint::new("192.168.4.1", 81));
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        let result = "10.0.0.5:http".parse::<DeviceEndpoint>();
        assert!(matches!(result, Err(EndpointError::InvalidPort(_))));
    }

    #[test]
    fn test_parse_rejects_empty_host() {
        assert_eq!("".parse::<DeviceEndpoint>(), Err(EndpointError::EmptyHost));
        assert_eq!(":81".parse::<DeviceEndpoint>(), Err(EndpointError::EmptyHost));
    }

    #[test]
    fn test_ws_url_and_display() {
        let ep = DeviceEndpoint::with_default_port("192.168.1.100");
        assert_eq!(ep.ws_url(), "ws://192.168.1.100:81/");
        assert_eq!(ep.to_string(), "192.168.1.100:81");
    }
}
