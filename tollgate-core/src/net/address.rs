use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A proxy or backend endpoint: IPv4/hostname, bracketed IPv6, or a
/// Unix-domain path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl NetworkAddress {
    /// Parse `host[:port]`, `[v6]:port`, or `/path`. An empty host
    /// means "all interfaces".
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(NetworkAddress::Unix(PathBuf::from(s)));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // bracketed IPv6: [::1]:4040
            let close = rest
                .find(']')
                .ok_or_else(|| Error::Configuration(format!("unterminated IPv6 address: {s:?}")))?;

            let host = &rest[..close];
            let port = match &rest[close + 1..] {
                "" => None,
                p => Some(
                    p.strip_prefix(':')
                        .ok_or_else(|| {
                            Error::Configuration(format!("expected ':' after ']' in {s:?}"))
                        })?,
                ),
            };

            (host, port)
        } else {
            match s.rsplit_once(':') {
                // a second ':' means a bare IPv6 address; require brackets
                Some((host, _)) if host.contains(':') => {
                    return Err(Error::Configuration(format!(
                        "IPv6 addresses need brackets: [{s}]:{default_port}"
                    )));
                }
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| Error::Configuration(format!("invalid port in {s:?}")))?,
            None => default_port,
        };

        let host = if host.is_empty() { "0.0.0.0" } else { host };

        Ok(NetworkAddress::Tcp {
            host: host.to_owned(),
            port,
        })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, NetworkAddress::Unix(_))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAddress::Tcp { host, port } if host.contains(':') => {
                write!(f, "[{host}]:{port}")
            }
            NetworkAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            NetworkAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
