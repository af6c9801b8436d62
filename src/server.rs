//! Connection dispatcher and per-connection workflow
//!
//! Every accepted socket gets its own task: read the request line, take over
//! the tunnel for CONNECT, forward the request, then hand one trace record to
//! the tracer. Nothing is shared between connections except the context.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::http_client::Forwarder;
use crate::logger::{SharedRequestTracer, TraceRecord};
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::http_parser::{ClientSession, ClientStream, RequestLine};
use crate::mitm::interceptor::MitmInterceptor;
use crate::mitm::trust_store::{DirectoryTrustStore, MemoryTrustStore, TrustStore};
use crate::request::ProxyRequest;

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Consecutive accept failures tolerated before the loop gives up
const MAX_ACCEPT_FAILURES: u32 = 8;

/// Process-wide state shared by all connection workers.
pub struct ProxyContext {
    pub interceptor: MitmInterceptor,
    pub forwarder: Forwarder,
    pub tracer: SharedRequestTracer,
    pub clock: Arc<dyn Clock>,
}

impl ProxyContext {
    pub fn new(
        ca: Option<Arc<CertificateAuthority>>,
        forwarder: Forwarder,
        tracer: SharedRequestTracer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interceptor: MitmInterceptor::new(ca, Arc::clone(&clock)),
            forwarder,
            tracer,
            clock,
        }
    }

    /// Build the context from configuration.
    ///
    /// A root that cannot be generated or installed leaves the proxy running
    /// in plaintext-only mode.
    pub async fn from_config(config: &Config, tracer: SharedRequestTracer) -> Result<Self> {
        let forwarder = Forwarder::new(config.upstream_timeout())?;

        let ca = if config.https_interception_enabled {
            let store: Arc<dyn TrustStore> = match &config.cert_store_path {
                Some(path) => {
                    info!(path = %path.display(), "Using directory trust store");
                    Arc::new(DirectoryTrustStore::new(path))
                }
                None => Arc::new(MemoryTrustStore::new()),
            };

            match CertificateAuthority::initialize(&config.ca_config(), store).await {
                Ok(ca) => Some(Arc::new(ca)),
                Err(e) => {
                    warn!(error = %e, "Root certificate unavailable, HTTPS interception disabled");
                    None
                }
            }
        } else {
            info!("HTTPS interception disabled by configuration");
            None
        };

        Ok(Self::new(ca, forwarder, tracer, Arc::new(SystemClock)))
    }
}

/// Bound, not yet accepting, proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, context: Arc<ProxyContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop on its own task.
    pub fn start(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(addr = %local_addr, "Proxy listening");
        let task = tokio::spawn(accept_loop(self.listener, self.context, shutdown_rx));

        Ok(ServerHandle {
            shutdown: shutdown_tx,
            task,
            local_addr,
        })
    }
}

/// Control channel of a running accept loop
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and wait for the accept loop to finish.
    ///
    /// Connections already handed to workers are left to finish on their own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Accept loop terminated abnormally");
        }
        info!(addr = %self.local_addr, "Proxy stopped");
    }

    /// Whether the accept loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        failures = 0;
                        debug!(peer = %peer_addr, "Accepted connection");

                        let context = Arc::clone(&context);
                        tokio::spawn(async move {
                            handle_client(stream, peer_addr.ip(), &context).await;
                        });
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > MAX_ACCEPT_FAILURES {
                            error!(error = %e, failures, "Accept keeps failing, stopping listener");
                            break;
                        }
                        warn!(error = %e, failures, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
    // Listener dropped here, closing the socket.
}

/// Drive one client connection from request line to trace record.
pub async fn handle_client<S: ClientStream + 'static>(
    stream: S,
    client_address: IpAddr,
    context: &ProxyContext,
) {
    let mut request = ProxyRequest::new(client_address, context.clock.now());

    let mut session = match initialize(ClientSession::new(stream), &mut request, context).await {
        Ok(session) => session,
        Err(e) => {
            if matches!(e, ProxyError::MalformedRequest(_)) || e.is_benign() {
                debug!(client = %client_address, error = %e, "Connection dropped during initialization");
            } else {
                warn!(client = %client_address, error = %e, "Request initialization failed");
            }
            return;
        }
    };
    request.initialization_succeeded = true;

    match context.forwarder.forward(&mut session, &mut request).await {
        Ok(bytes) => debug!(command = %request.http_command(), bytes, "Request complete"),
        Err(e) if e.is_benign() => {
            debug!(command = %request.http_command(), "Client disconnected during response")
        }
        Err(e) => warn!(command = %request.http_command(), error = %e, "Forwarding failed"),
    }
    let _ = session.shutdown().await;

    context.tracer.trace(TraceRecord::from(&request));
}

/// Read the request line and, for CONNECT, run the interception handshake.
///
/// Returns the session positioned at the first header line of the request
/// to forward.
pub async fn initialize(
    mut session: ClientSession,
    request: &mut ProxyRequest,
    context: &ProxyContext,
) -> Result<ClientSession> {
    let line = match session.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => return Err(ProxyError::malformed("empty request line")),
    };
    let request_line = RequestLine::parse(&line)?;

    request.method = request_line.method.clone();
    request.remote_uri = request_line.target.clone();
    request.http_version = request_line.version;

    if request_line.is_connect() {
        context
            .interceptor
            .intercept(session, request, &request_line.target)
            .await
    } else {
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::http_client::DEFAULT_UPSTREAM_TIMEOUT;
    use crate::logger::MemoryTracer;
    use crate::request::HttpVersion;
    use chrono::Local;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context(tracer: Arc<MemoryTracer>) -> ProxyContext {
        ProxyContext::new(
            None,
            Forwarder::new(DEFAULT_UPSTREAM_TIMEOUT).unwrap(),
            tracer,
            Arc::new(FixedClock(Local::now())),
        )
    }

    fn request() -> ProxyRequest {
        ProxyRequest::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Local::now())
    }

    #[tokio::test]
    async fn test_initialize_plain_request() {
        let ctx = context(Arc::new(MemoryTracer::new()));
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET http://example.com/ HTTP/1.0\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut req = request();
        let mut session = initialize(ClientSession::new(server), &mut req, &ctx)
            .await
            .unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.remote_uri, "http://example.com/");
        assert_eq!(req.http_version, HttpVersion::HTTP_10);
        assert!(!req.is_https);
        assert_eq!(session.read_line().await.unwrap().unwrap(), "Host: example.com");
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_line() {
        let ctx = context(Arc::new(MemoryTracer::new()));
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"\r\n").await.unwrap();

        let result = initialize(ClientSession::new(server), &mut request(), &ctx).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_version() {
        let ctx = context(Arc::new(MemoryTracer::new()));
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET /\r\n").await.unwrap();

        let result = initialize(ClientSession::new(server), &mut request(), &ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_idle_probe_not_traced() {
        let tracer = Arc::new(MemoryTracer::new());
        let ctx = context(Arc::clone(&tracer));
        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        handle_client(server, IpAddr::V4(Ipv4Addr::LOCALHOST), &ctx).await;
        assert!(tracer.records().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_origin_traced_without_status() {
        let tracer = Arc::new(MemoryTracer::new());
        let ctx = context(Arc::clone(&tracer));

        // Reserve a port, then free it so nothing is listening there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();

        handle_client(server, IpAddr::V4(Ipv4Addr::LOCALHOST), &ctx).await;

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        let records = tracer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, None);
        assert_eq!(records[0].method, "GET");
    }

    #[tokio::test]
    async fn test_stop_joins_accept_loop() {
        let ctx = Arc::new(context(Arc::new(MemoryTracer::new())));
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap();
        let handle = server.start().unwrap();
        let addr = handle.local_addr();

        handle.stop().await;

        // The listening socket is closed once stop returns.
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
