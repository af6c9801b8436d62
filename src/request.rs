//! Per-connection request state

use chrono::{DateTime, Local};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ProxyError;

/// HTTP protocol version as a major.minor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Version to use for the outbound request; only 1.0 and 1.1 are sent.
    pub fn to_http(self) -> reqwest::Version {
        match (self.major, self.minor) {
            (1, 0) => reqwest::Version::HTTP_10,
            _ => reqwest::Version::HTTP_11,
        }
    }
}

impl Default for HttpVersion {
    fn default() -> Self {
        Self::HTTP_11
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parses a protocol token such as `HTTP/1.1`.
impl FromStr for HttpVersion {
    type Err = ProxyError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let digits = token
            .strip_prefix("HTTP/")
            .ok_or_else(|| ProxyError::malformed(format!("invalid version token '{}'", token)))?;
        let (major, minor) = digits
            .split_once('.')
            .ok_or_else(|| ProxyError::malformed(format!("invalid version token '{}'", token)))?;

        let major = major
            .parse()
            .map_err(|_| ProxyError::malformed(format!("invalid major version '{}'", major)))?;
        let minor = minor
            .parse()
            .map_err(|_| ProxyError::malformed(format!("invalid minor version '{}'", minor)))?;

        Ok(Self { major, minor })
    }
}

/// One client connection attempt.
///
/// Created by the request initializer, mutated by the CONNECT handshake and
/// the forwarder, and finally read by the tracer. Owned by the worker
/// handling the connection.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Absolute URI of the origin resource; rewritten as the tunnel resolves.
    pub remote_uri: String,
    pub http_version: HttpVersion,
    pub is_https: bool,
    pub content_length: u64,
    pub client_address: IpAddr,
    /// Set only once the origin produced a response.
    pub status_code: Option<u16>,
    pub request_timestamp: DateTime<Local>,
    pub initialization_succeeded: bool,
}

impl ProxyRequest {
    pub fn new(client_address: IpAddr, request_timestamp: DateTime<Local>) -> Self {
        Self {
            method: String::new(),
            remote_uri: String::new(),
            http_version: HttpVersion::default(),
            is_https: false,
            content_length: 0,
            client_address,
            status_code: None,
            request_timestamp,
            initialization_succeeded: false,
        }
    }

    /// `METHOD URI HTTP/x.y`
    pub fn http_command(&self) -> String {
        format!(
            "{} {} HTTP/{}",
            self.method, self.remote_uri, self.http_version
        )
    }
}
