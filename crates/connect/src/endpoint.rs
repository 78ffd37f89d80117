//! Network endpoint identity.

use std::{fmt, str::FromStr};

use crate::error::{ConfigSnafu, ConnectError, Result};

/// Host and port of a cluster node.
///
/// Two endpoints are the same node when host and port are equal; the
/// connection cache keys channels on this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host name or IP literal and a port.
    ///
    /// IPv6 literals may be given with or without brackets.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Config`] if the host is empty or the port is zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let host = host.trim().trim_start_matches('[').trim_end_matches(']').to_owned();

        if host.is_empty() {
            return ConfigSnafu { message: "endpoint host cannot be empty" }.fail();
        }
        if host.contains(char::is_whitespace) {
            return ConfigSnafu { message: format!("endpoint host '{host}' contains whitespace") }
                .fail();
        }
        if port == 0 {
            return ConfigSnafu { message: format!("endpoint '{host}' has port 0") }.fail();
        }

        Ok(Self { host, port })
    }

    /// Returns the host name or IP literal (IPv6 without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the URL used to open a transport channel to this endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{self}")
    }

    fn is_ipv6_literal(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6_literal() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConnectError;

    /// Parses `host:port`, `[v6]:port`, optionally prefixed by `http://`.
    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let rest = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                ConfigSnafu { message: format!("unterminated IPv6 literal in '{value}'") }.build()
            })?;
            let port = tail.strip_prefix(':').ok_or_else(|| {
                ConfigSnafu { message: format!("missing port in '{value}'") }.build()
            })?;
            (host, port)
        } else {
            rest.rsplit_once(':').ok_or_else(|| {
                ConfigSnafu { message: format!("missing port in '{value}'") }.build()
            })?
        };

        let port = port.parse::<u16>().map_err(|e| {
            ConfigSnafu { message: format!("invalid port in '{value}': {e}") }.build()
        })?;

        Self::new(host, port)
    }
}
