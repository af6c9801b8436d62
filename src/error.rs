//! Proxy error types

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised while handling a single proxied connection.
///
/// None of these are fatal to the process: each one tears down the
/// connection it was raised on and nothing else. An origin answering with a
/// 4xx/5xx status is not an error at all and is relayed like any response.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Empty or unsplittable request line or header line
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Root or leaf certificate generation/installation failed
    #[error("Certificate operation failed: {0}")]
    CryptoFailure(String),

    /// TLS negotiation with the client failed
    #[error("TLS handshake failed for {host}: {reason}")]
    HandshakeFailure { host: String, reason: String },

    /// The origin could not be reached and produced no response
    #[error("Upstream request failed: {0}")]
    UpstreamFailure(String),

    /// The client went away while the response was being written
    #[error("Client disconnected")]
    ClientDisconnect,

    /// Certificate trust store backend error
    #[error("Trust store error: {0}")]
    TrustStore(#[from] crate::mitm::trust_store::TrustStoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Create a malformed request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// Create a crypto failure error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::CryptoFailure(msg.into())
    }

    /// Create a TLS handshake error
    pub fn handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HandshakeFailure {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create an upstream failure error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamFailure(msg.into())
    }

    /// Whether this error is the client hanging up rather than a fault.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::ClientDisconnect => true,
            Self::Io(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// Reset, broken pipe and friends while talking to the client.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
