//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides HTTPS interception for the proxy.
//! It includes:
//! - Root CA generation and per-host leaf issuance with an LRU cache
//! - Trust store providers (in-memory and directory-backed)
//! - Client-facing TLS configuration
//! - The line scanner used on client streams
//! - The CONNECT interception handshake

pub mod ca;
pub mod certificate_authority;
pub mod http_parser;
pub mod interceptor;
pub mod tls_config;
pub mod trust_store;

// Re-export main types
pub use ca::{CaConfig, LeafCertificate, RootCertificate};
pub use certificate_authority::CertificateAuthority;
pub use http_parser::{parse_authority, ClientSession, ClientStream, RequestLine};
pub use interceptor::{HandshakeState, MitmInterceptor};
pub use tls_config::{ClientTlsConfig, TlsConfigError};
pub use trust_store::{
    DirectoryTrustStore, IssuerId, MemoryTrustStore, StoreLocation, StoredCertificate,
    TrustStore, TrustStoreError,
};
