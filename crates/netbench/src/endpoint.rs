//! `host:port` endpoint references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TestbedError;

/// A network endpoint: data-plane configuration address or controller address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint on all local addresses, as used for agent listen sockets.
    pub fn any(port: u16) -> Self {
        Self::new("0.0.0.0", port)
    }

    /// Address to dial when probing this endpoint from the orchestrator.
    ///
    /// A wildcard listen address is probed through loopback.
    pub fn dial_addr(&self) -> String {
        match self.host.as_str() {
            "0.0.0.0" => format!("127.0.0.1:{}", self.port),
            "::" | "[::]" => format!("[::1]:{}", self.port),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TestbedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TestbedError::config("endpoint", format!("'{}' is not host:port", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TestbedError::config(
                "endpoint",
                format!("'{}' has an empty host", s),
            ));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| TestbedError::config("endpoint", format!("'{}' has an invalid port", s)))?;
        if port == 0 {
            return Err(TestbedError::config(
                "endpoint",
                format!("'{}' uses port 0", s),
            ));
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TestbedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ep: Endpoint = "127.0.0.1:6653".parse().unwrap();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 6653));
        assert_eq!(ep.to_string(), "127.0.0.1:6653");
    }

    #[test]
    fn test_parse_ipv6() {
        let ep: Endpoint = "[::1]:50051".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 50051);
        assert_eq!(ep.to_string(), "[::1]:50051");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!(":50051".parse::<Endpoint>().is_err());
        assert!("localhost:http".parse::<Endpoint>().is_err());
        assert!("localhost:0".parse::<Endpoint>().is_err());
        assert!("localhost:70000".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_dial_addr() {
        assert_eq!(Endpoint::any(50051).dial_addr(), "127.0.0.1:50051");
        assert_eq!(
            Endpoint::new("10.0.0.1", 50051).dial_addr(),
            "10.0.0.1:50051"
        );
    }

    #[test]
    fn test_serde_as_string() {
        let ep: Endpoint = serde_yaml::from_str("\"127.0.0.1:50051\"").unwrap();
        assert_eq!(ep.port, 50051);
        let yaml = serde_yaml::to_string(&ep).unwrap();
        assert!(yaml.contains("127.0.0.1:50051"));
    }
}
