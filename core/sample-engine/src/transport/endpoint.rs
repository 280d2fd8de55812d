use crate::error::{EngineError, Result};
use std::fmt;
use std::str::FromStr;

/// Transport address in `scheme://address` form.
///
/// Supported schemes are `tcp://host:port` and `inproc://name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Inproc(String),
}

impl Endpoint {
    /// Build a TCP endpoint from already validated host/port fields
    pub fn tcp<H: Into<String>>(host: H, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn inproc<N: Into<String>>(name: N) -> Self {
        Self::Inproc(name.into())
    }

    /// Parse `tcp://127.0.0.1:9445` or `inproc://name`
    pub fn parse(address: &str) -> Result<Self> {
        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| EngineError::invalid_endpoint(address, "missing '://'"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| EngineError::invalid_endpoint(address, "missing port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(EngineError::invalid_endpoint(address, "missing host"));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EngineError::invalid_endpoint(address, "invalid port"))?;
                Ok(Self::tcp(host, port))
            }
            "inproc" => {
                if rest.is_empty() {
                    return Err(EngineError::invalid_endpoint(address, "missing name"));
                }
                Ok(Self::inproc(rest))
            }
            other => Err(EngineError::invalid_endpoint(
                address,
                format!("unsupported scheme '{}'", other),
            )),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Inproc(_) => "inproc",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
