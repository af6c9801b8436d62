//! http-logger - MITM HTTP/HTTPS logging proxy
//!
//! An explicit forward proxy that terminates client connections, re-issues
//! each request against the real origin and relays the answer, emitting one
//! trace record per request. HTTPS is intercepted by answering `CONNECT`
//! itself and accepting TLS with a leaf certificate issued on the fly by a
//! locally generated root.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use http_logger::{Config, LoggingTracer, ProxyContext, ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let context = ProxyContext::from_config(&config, Arc::new(LoggingTracer)).await?;
//!
//!     let server = ProxyServer::bind(config.listen_addr()?, Arc::new(context)).await?;
//!     let handle = server.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - accept loop, request initialization, per-connection workflow
//! - `http_client` - header translation and forwarding to the origin
//! - `mitm` - root CA, leaf issuance, trust stores, CONNECT interception
//! - `logger` - trace records and the tracer seam
//! - `config` - environment configuration

pub mod clock;
pub mod config;
pub mod error;
pub mod http_client;
pub mod logger;
pub mod mitm;
pub mod request;
pub mod server;

// Re-export commonly used types

/// Configuration types
pub use config::{Config, LogFormat};

/// Errors
pub use error::{ProxyError, Result};

/// Collaborators
pub use clock::{Clock, FixedClock, SystemClock};
pub use logger::{LoggingTracer, MemoryTracer, RequestTracer, SharedRequestTracer, TraceRecord};

/// Request model
pub use request::{HttpVersion, ProxyRequest};

/// Forwarding
pub use http_client::{split_set_cookie, translate_response_headers, Forwarder};

/// Server
pub use server::{handle_client, ProxyContext, ProxyServer, ServerHandle};

/// MITM types and functionality
pub use mitm::{
    CaConfig, CertificateAuthority, ClientSession, ClientTlsConfig, DirectoryTrustStore,
    HandshakeState, IssuerId, LeafCertificate, MemoryTrustStore, MitmInterceptor,
    RootCertificate, StoreLocation, StoredCertificate, TrustStore, TrustStoreError,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
