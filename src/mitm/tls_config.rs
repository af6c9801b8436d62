//! TLS Configuration - client-facing TLS for intercepted tunnels
//!
//! The proxy acts as a TLS server towards the client, presenting a leaf
//! issued by our own root. Every protocol version rustls implements is
//! enabled so that older clients are not turned away during negotiation;
//! only HTTP/1.1 is offered over ALPN.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::ca::LeafCertificate;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Unsupported protocol versions: {0}")]
    Versions(String),

    #[error("Invalid certificate or key: {0}")]
    InvalidCertificate(String),
}

/// Client-facing TLS config (proxy acts as server with a leaf certificate)
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Server config presenting `leaf` and its issuing root
    pub fn from_leaf(leaf: &LeafCertificate) -> Result<Self, TlsConfigError> {
        Self::new(leaf.cert_chain(), leaf.private_key())
    }

    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .map_err(|e| TlsConfigError::Versions(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(versions = rustls::ALL_VERSIONS.len(), "Client-facing TLS config created");

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::ca::{RootCertificate, DEFAULT_ROOT_NAME, MIN_KEY_STRENGTH};

    #[test]
    fn test_config_from_leaf() {
        let root = RootCertificate::generate(DEFAULT_ROOT_NAME, MIN_KEY_STRENGTH).unwrap();
        let leaf = root.issue_leaf("example.com").unwrap();

        let config = ClientTlsConfig::from_leaf(&leaf).unwrap();
        assert_eq!(
            config.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_tls12_only_client_accepted() {
        let root = RootCertificate::generate(DEFAULT_ROOT_NAME, MIN_KEY_STRENGTH).unwrap();
        let leaf = root.issue_leaf("example.com").unwrap();
        let config = ClientTlsConfig::from_leaf(&leaf).unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(root.cert_der()).unwrap();
        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let acceptor = tokio_rustls::TlsAcceptor::from(config.server_config());
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let name = rustls::pki_types::ServerName::try_from("example.com").unwrap();

        let (server, client) = tokio::join!(
            acceptor.accept(server_io),
            connector.connect(name, client_io)
        );
        server.unwrap();
        let client = client.unwrap();
        assert_eq!(
            client.get_ref().1.protocol_version(),
            Some(rustls::ProtocolVersion::TLSv1_2)
        );
    }
}
