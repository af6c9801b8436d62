//! MITM Interceptor - CONNECT tunnel takeover
//!
//! Walks a CONNECT request through the interception handshake:
//! 1. Rewrite the target as `https://host:port` and drain the CONNECT headers
//! 2. Answer `200 Connection established` on the plaintext socket
//! 3. Accept TLS from the client with a leaf issued for the target host
//! 4. Read the real request line inside the tunnel and complete the URI

use std::fmt;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ProxyError, Result};
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::http_parser::{parse_authority, ClientSession, RequestLine};
use crate::mitm::tls_config::ClientTlsConfig;
use crate::request::ProxyRequest;

/// Value of the `Proxy-agent` header in the tunnel reply
pub const PROXY_AGENT: &str = "http-logger.net";

/// Progress through the CONNECT handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    TunnelRequested,
    HeadersDrained,
    TunnelEstablishedReply,
    TlsUpgraded,
    InnerRequestLineRead,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::TunnelRequested => "tunnel-requested",
            HandshakeState::HeadersDrained => "headers-drained",
            HandshakeState::TunnelEstablishedReply => "tunnel-established-reply",
            HandshakeState::TlsUpgraded => "tls-upgraded",
            HandshakeState::InnerRequestLineRead => "inner-request-line-read",
        };
        f.write_str(name)
    }
}

/// Tunnel reply written before the client starts TLS.
pub fn tunnel_established_reply(request: &ProxyRequest, clock: &dyn Clock) -> String {
    format!(
        "HTTP/{} 200 Connection established\r\nTimestamp: {}\r\nProxy-agent: {}\r\n\r\n",
        request.http_version,
        clock.now().format("%m/%d/%Y %H:%M:%S"),
        PROXY_AGENT
    )
}

/// Turns CONNECT tunnels into decrypted client sessions.
pub struct MitmInterceptor {
    /// Absent when root generation failed; every CONNECT then fails
    ca: Option<Arc<CertificateAuthority>>,

    clock: Arc<dyn Clock>,
}

impl MitmInterceptor {
    pub fn new(ca: Option<Arc<CertificateAuthority>>, clock: Arc<dyn Clock>) -> Self {
        Self { ca, clock }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca.is_some()
    }

    /// Run the handshake for a CONNECT to `target` (`host:port`).
    ///
    /// On success returns the session over the decrypted stream, positioned
    /// just after the inner request line, with `request` describing the
    /// real request. Any failure tears the connection down.
    pub async fn intercept(
        &self,
        session: ClientSession,
        request: &mut ProxyRequest,
        target: &str,
    ) -> Result<ClientSession> {
        let mut state = HandshakeState::TunnelRequested;
        let result = self.run(session, request, target, &mut state).await;
        if let Err(e) = &result {
            if e.is_benign() {
                debug!(target = %target, state = %state, error = %e, "Client left during CONNECT handshake");
            } else {
                warn!(target = %target, state = %state, error = %e, "CONNECT handshake failed");
            }
        }
        result
    }

    async fn run(
        &self,
        mut session: ClientSession,
        request: &mut ProxyRequest,
        target: &str,
        state: &mut HandshakeState,
    ) -> Result<ClientSession> {
        let (host, port) = parse_authority(target)?;
        request.remote_uri = format!("https://{}", target);
        request.is_https = true;

        // The CONNECT request's own headers carry nothing we need.
        loop {
            match session.read_line().await? {
                Some(line) if line.is_empty() => break,
                Some(_) => continue,
                None => return Err(ProxyError::malformed("client closed before end of CONNECT headers")),
            }
        }
        *state = HandshakeState::HeadersDrained;

        session
            .write_all(tunnel_established_reply(request, self.clock.as_ref()).as_bytes())
            .await?;
        session.flush().await?;
        *state = HandshakeState::TunnelEstablishedReply;
        debug!(host = %host, port, "Tunnel established, awaiting TLS");

        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| ProxyError::handshake(&host, "HTTPS interception is unavailable"))?;
        let leaf = ca.issue_or_get_leaf(&host).await?;
        let tls_config = ClientTlsConfig::from_leaf(&leaf)
            .map_err(|e| ProxyError::handshake(&host, e.to_string()))?;

        let stream = session.into_inner();
        let tls_stream = TlsAcceptor::from(tls_config.server_config())
            .accept(stream)
            .await
            .map_err(|e| ProxyError::handshake(&host, e.to_string()))?;
        *state = HandshakeState::TlsUpgraded;
        debug!(host = %host, "Client TLS handshake complete");

        let mut session = ClientSession::new(tls_stream);
        let line = match session.read_line().await? {
            Some(line) if !line.is_empty() => line,
            _ => {
                let _ = session.shutdown().await;
                return Err(ProxyError::malformed("empty request line inside tunnel"));
            }
        };
        let inner = RequestLine::parse(&line)?;

        request.method = inner.method;
        request.http_version = inner.version;
        if inner.target.starts_with("https://") || inner.target.starts_with("http://") {
            request.remote_uri = inner.target;
        } else {
            request.remote_uri.push_str(&inner.target);
        }
        *state = HandshakeState::InnerRequestLineRead;

        debug!(command = %request.http_command(), "Intercepted request");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{Local, TimeZone};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).single().unwrap(),
        ))
    }

    fn request() -> ProxyRequest {
        ProxyRequest::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Local::now())
    }

    #[test]
    fn test_tunnel_reply_format() {
        let reply = tunnel_established_reply(&request(), fixed_clock().as_ref());
        assert_eq!(
            reply,
            "HTTP/1.1 200 Connection established\r\n\
             Timestamp: 03/07/2024 09:05:02\r\n\
             Proxy-agent: http-logger.net\r\n\r\n"
        );
    }

    #[test]
    fn test_state_names() {
        assert_eq!(HandshakeState::TunnelRequested.to_string(), "tunnel-requested");
        assert_eq!(HandshakeState::TlsUpgraded.to_string(), "tls-upgraded");
    }

    #[tokio::test]
    async fn test_connect_without_ca_replies_then_fails() {
        let (client, server) = tokio::io::duplex(4096);
        let interceptor = MitmInterceptor::new(None, fixed_clock());
        assert!(!interceptor.is_enabled());

        let mut client = BufReader::new(client);
        client
            .get_mut()
            .write_all(b"Host: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut req = request();
        let result = interceptor
            .intercept(ClientSession::new(server), &mut req, "example.com:443")
            .await;

        assert!(matches!(result, Err(ProxyError::HandshakeFailure { .. })));
        assert_eq!(req.remote_uri, "https://example.com:443");
        assert!(req.is_https);

        let mut status = String::new();
        client.read_line(&mut status).await.unwrap();
        assert_eq!(status, "HTTP/1.1 200 Connection established\r\n");
    }

    #[tokio::test]
    async fn test_connect_with_bad_authority() {
        let (_client, server) = tokio::io::duplex(1024);
        let interceptor = MitmInterceptor::new(None, fixed_clock());

        let mut req = request();
        let result = interceptor
            .intercept(ClientSession::new(server), &mut req, "example.com:0")
            .await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }
}
