//! Header translation and request forwarding
//!
//! Reads the client's header block, rebuilds the request for the origin,
//! sends it, and relays status line, headers and body back to the client.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Body, Method, RequestBuilder, Response};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{is_disconnect, ProxyError, Result};
use crate::mitm::http_parser::{parse_header_line, ClientSession};
use crate::request::ProxyRequest;

/// Marker header appended to every relayed response
pub const PROXIED_BY_HEADER: &str = "X-Proxied-By";
pub const PROXIED_BY_VALUE: &str = "http-logger.net";

/// Default outbound timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

const READ_BUFFER_SIZE: usize = 8192;
const MAX_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Request body chunks in flight between the client reader and the origin
const BODY_CHANNEL_DEPTH: usize = 4;

/// Header names whose usual spelling is not plain title case
const IRREGULAR_HEADER_NAMES: &[&str] = &[
    "ETag",
    "WWW-Authenticate",
    "Content-MD5",
    "Content-ID",
    "DNT",
    "TE",
    "X-XSS-Protection",
    "X-UA-Compatible",
    "X-DNS-Prefetch-Control",
    "Sec-WebSocket-Accept",
    "Sec-WebSocket-Protocol",
    "Sec-WebSocket-Extensions",
    "Sec-WebSocket-Version",
    "P3P",
];

/// Client request headers, sorted into what the outbound request needs.
#[derive(Debug, Default)]
pub struct RequestHeaders {
    /// Headers to send to the origin
    pub headers: HeaderMap,

    /// Value of the client's `Host` header
    pub host: Option<String>,

    /// Declared body length; 0 when absent or unparseable
    pub content_length: u64,
}

impl RequestHeaders {
    /// Apply one client header.
    pub fn apply(&mut self, name: &str, value: &str) {
        match name.to_ascii_lowercase().as_str() {
            "host" => {
                self.host = Some(value.to_string());
                self.insert(header::HOST, value);
            }
            "user-agent" => self.insert(header::USER_AGENT, value),
            "accept" => self.insert(header::ACCEPT, value),
            "referer" => self.insert(header::REFERER, value),
            "cookie" => self.insert(header::COOKIE, value),
            "content-type" => self.insert(header::CONTENT_TYPE, value),
            "if-modified-since" => match parse_http_date(value) {
                Some(date) => self.insert(header::IF_MODIFIED_SINCE, &date),
                None => debug!(value = %value, "Skipping unparseable If-Modified-Since"),
            },
            "expect" => {
                if !value.eq_ignore_ascii_case("100-continue") {
                    self.insert(header::EXPECT, value);
                }
            }
            "content-length" => {
                self.content_length = value.trim().parse().unwrap_or(0);
            }
            // Connection management is never forwarded. The body is always
            // re-sent with a known length, so client framing goes too.
            "proxy-connection" | "connection" | "keep-alive" | "transfer-encoding" => {}
            _ => match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    self.headers.append(name, value);
                }
                _ => warn!(header = %name, "Skipping header that cannot be forwarded"),
            },
        }
    }

    fn insert(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Skipping header with invalid value"),
        }
    }
}

/// Parse an HTTP date, ignoring any `;`-delimited qualifier, and re-emit it
/// in IMF-fixdate form.
pub fn parse_http_date(value: &str) -> Option<String> {
    let date = value.split(';').next().unwrap_or_default().trim();
    if date.is_empty() {
        return None;
    }

    let parsed = DateTime::parse_from_rfc2822(date)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date).map(|d| d.with_timezone(&Utc)))
        .or_else(|_| {
            // RFC 850 and asctime forms
            NaiveDateTime::parse_from_str(date, "%A, %d-%b-%y %H:%M:%S GMT")
                .or_else(|_| NaiveDateTime::parse_from_str(date, "%a %b %e %H:%M:%S %Y"))
                .map(|naive| naive.and_utc())
        })
        .ok()?;

    Some(parsed.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Split a `Set-Cookie` value on commas that are not followed by a space.
///
/// Origins sometimes comma-join several cookies into one header; a comma
/// followed by a space belongs to a cookie attribute such as `Expires`.
pub fn split_set_cookie(value: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut start = 0;
    let bytes = value.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if b == b',' && bytes.get(i + 1) != Some(&b' ') {
            fragments.push(&value[start..i]);
            start = i + 1;
        }
    }
    fragments.push(&value[start..]);

    fragments
        .into_iter()
        .filter(|fragment| !fragment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Response headers as written to the client, in order.
///
/// Every header except `Set-Cookie` in origin order, then one line per
/// cookie fragment, then the proxy marker.
pub fn translate_response_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut translated = Vec::with_capacity(headers.len() + 1);
    let mut cookies = Vec::new();

    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if name == header::SET_COOKIE {
            cookies.extend(split_set_cookie(&value));
        } else if name == header::TRANSFER_ENCODING {
            // The body is relayed de-chunked and close-delimited.
            continue;
        } else {
            translated.push((canonical_name(name.as_str()), value));
        }
    }

    translated.extend(
        cookies
            .into_iter()
            .map(|cookie| ("Set-Cookie".to_string(), cookie)),
    );
    translated.push((PROXIED_BY_HEADER.to_string(), PROXIED_BY_VALUE.to_string()));
    translated
}

/// `content-type` -> `Content-Type`, `etag` -> `ETag`
fn canonical_name(name: &str) -> String {
    if let Some(known) = IRREGULAR_HEADER_NAMES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(name))
    {
        return known.to_string();
    }

    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// The origin's own reason phrase, or the standard one for the code.
fn reason_phrase(response: &Response) -> String {
    match response.extensions().get::<hyper::ext::ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Outbound body fed from `rx`; ends when the sender is dropped.
fn streaming_body(rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Body {
    Body::wrap_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}

/// Copy `len` body bytes from the client into `tx`, one chunk at a time.
///
/// Returns the number of bytes handed over. Stops early, without error, if
/// the outbound request stops taking the body.
async fn pump_body(
    session: &mut ClientSession,
    len: u64,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut remaining = len;

    while remaining > 0 {
        let want = remaining.min(READ_BUFFER_SIZE as u64) as usize;
        let n = session.read_chunk(&mut buf[..want]).await?;
        if n == 0 {
            let message = format!("client sent {} of {} body bytes", len - remaining, len);
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, message.clone())))
                .await;
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                message,
            )));
        }
        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
            break;
        }
        remaining -= n as u64;
    }

    Ok(len - remaining)
}

fn client_write_error(e: io::Error) -> ProxyError {
    if is_disconnect(&e) {
        ProxyError::ClientDisconnect
    } else {
        ProxyError::Io(e)
    }
}

/// Re-issues client requests against the origin and relays the answer.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,

    /// Deadline for the origin to answer; the body is not covered
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        // No proxy, no redirects, no keep-alive; without the decompression
        // features reqwest hands back exactly the bytes the origin sent.
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .http1_only()
            .connect_timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| ProxyError::upstream(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Forward the request whose request line has already been read.
    ///
    /// Sets `request.status_code` once the origin answers and returns the
    /// number of body bytes relayed.
    pub async fn forward(
        &self,
        session: &mut ClientSession,
        request: &mut ProxyRequest,
    ) -> Result<u64> {
        let mut headers = RequestHeaders::default();
        loop {
            match session.read_line().await? {
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    let (name, value) = parse_header_line(&line)?;
                    headers.apply(&name, &value);
                }
                None => return Err(ProxyError::malformed("client closed before end of headers")),
            }
        }
        request.content_length = headers.content_length;

        if request.remote_uri.starts_with('/') {
            let host = headers.host.as_deref().ok_or_else(|| {
                ProxyError::malformed("origin-form request without a Host header")
            })?;
            request.remote_uri = format!("http://{}{}", host, request.remote_uri);
        }

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyError::malformed(format!("invalid method '{}'", request.method)))?;

        debug!(command = %request.http_command(), "Forwarding request");

        let mut outbound = self
            .client
            .request(method, request.remote_uri.as_str())
            .version(request.http_version.to_http())
            .headers(headers.headers);

        let mut body_sender = None;
        if request.method.eq_ignore_ascii_case("POST") {
            if request.content_length == 0 {
                outbound = outbound.body(Vec::new());
            } else {
                let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
                outbound = outbound
                    .header(header::CONTENT_LENGTH, request.content_length)
                    .body(streaming_body(rx));
                body_sender = Some((request.content_length, tx));
            }
        }

        let response = self
            .dispatch(session, &request.remote_uri, outbound, body_sender)
            .await?;
        request.status_code = Some(response.status().as_u16());

        self.relay(session, request, response).await
    }

    /// Send the request, streaming the client's body alongside when there
    /// is one, and wait at most `self.timeout` for the origin's answer.
    async fn dispatch(
        &self,
        session: &mut ClientSession,
        uri: &str,
        outbound: RequestBuilder,
        body: Option<(u64, mpsc::Sender<io::Result<Vec<u8>>>)>,
    ) -> Result<Response> {
        let send = timeout(self.timeout, outbound.send());
        tokio::pin!(send);

        let result = match body {
            None => send.await,
            Some((len, tx)) => {
                let pump = pump_body(session, len, tx);
                tokio::pin!(pump);
                let mut pumped = false;

                loop {
                    tokio::select! {
                        result = &mut send => break result,
                        result = &mut pump, if !pumped => {
                            pumped = true;
                            let bytes = result?;
                            debug!(bytes, "Request body forwarded");
                        }
                    }
                }
            }
        };

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::upstream(format!("{}: {}", uri, e))),
            Err(_) => Err(ProxyError::upstream(format!(
                "{}: no response within {:?}",
                uri, self.timeout
            ))),
        }
    }

    async fn relay(
        &self,
        session: &mut ClientSession,
        request: &ProxyRequest,
        mut response: Response,
    ) -> Result<u64> {
        let status = response.status();
        let mut head = format!(
            "HTTP/{} {} {}\r\n",
            request.http_version,
            status.as_u16(),
            reason_phrase(&response)
        );
        for (name, value) in translate_response_headers(response.headers()) {
            head.push_str(&name);
            head.push_str(": ");
            head.push_str(&value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let capacity = response
            .content_length()
            .map(|len| (len as usize).clamp(1, MAX_WRITE_BUFFER_SIZE))
            .unwrap_or(READ_BUFFER_SIZE);
        let mut writer = BufWriter::with_capacity(capacity, session.get_mut());

        writer
            .write_all(head.as_bytes())
            .await
            .map_err(client_write_error)?;

        let mut relayed = 0u64;
        let outcome = loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    writer.write_all(&chunk).await.map_err(client_write_error)?;
                    relayed += chunk.len() as u64;
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    break Err(ProxyError::upstream(format!("reading body failed: {}", e)))
                }
            }
        };
        // Whatever arrived before a body error still reaches the client.
        writer.flush().await.map_err(client_write_error)?;
        outcome?;

        debug!(status = status.as_u16(), bytes = relayed, "Response relayed");
        Ok(relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_set_cookie_on_bare_comma() {
        assert_eq!(split_set_cookie("x=1,y=2"), vec!["x=1", "y=2"]);
    }

    #[test]
    fn test_split_set_cookie_keeps_comma_space() {
        assert_eq!(split_set_cookie("x=1, y=2"), vec!["x=1, y=2"]);
        assert_eq!(
            split_set_cookie("id=a; Expires=Wed, 21 Oct 2015 07:28:00 GMT"),
            vec!["id=a; Expires=Wed, 21 Oct 2015 07:28:00 GMT"]
        );
    }

    #[test]
    fn test_split_set_cookie_mixed() {
        assert_eq!(
            split_set_cookie("a=1,b=2; Path=/, c=3"),
            vec!["a=1", "b=2; Path=/, c=3"]
        );
        assert_eq!(split_set_cookie("a=1,,b=2,"), vec!["a=1", "b=2"]);
        assert!(split_set_cookie("").is_empty());
    }

    #[test]
    fn test_translate_response_headers_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("a=1,b=2"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let translated = translate_response_headers(&headers);
        let names: Vec<&str> = translated.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["Content-Type", "Content-Length", "Set-Cookie", "Set-Cookie", "X-Proxied-By"]
        );
        assert_eq!(translated[2].1, "a=1");
        assert_eq!(translated[3].1, "b=2");
        assert_eq!(translated[4].1, "http-logger.net");
    }

    #[test]
    fn test_translate_keeps_multiple_set_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2,c=3"));

        let cookies: Vec<String> = translate_response_headers(&headers)
            .into_iter()
            .filter(|(n, _)| n == "Set-Cookie")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2", "c=3"]);
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("x-proxied-by"), "X-Proxied-By");
        assert_eq!(canonical_name("etag"), "ETag");
        assert_eq!(canonical_name("www-authenticate"), "WWW-Authenticate");
        assert_eq!(canonical_name("x-xss-protection"), "X-XSS-Protection");
        assert_eq!(canonical_name("cache-control"), "Cache-Control");
    }

    #[test]
    fn test_request_header_mapping() {
        let mut headers = RequestHeaders::default();
        headers.apply("Host", "example.com");
        headers.apply("User-Agent", "test");
        headers.apply("Proxy-Connection", "keep-alive");
        headers.apply("Connection", "keep-alive");
        headers.apply("Keep-Alive", "300");
        headers.apply("Expect", "100-continue");
        headers.apply("Content-Length", "42");
        headers.apply("X-Custom", "yes");

        assert_eq!(headers.host.as_deref(), Some("example.com"));
        assert_eq!(headers.content_length, 42);
        assert_eq!(headers.headers.get(header::HOST).unwrap(), "example.com");
        assert_eq!(headers.headers.get(header::USER_AGENT).unwrap(), "test");
        assert_eq!(headers.headers.get("x-custom").unwrap(), "yes");
        assert!(headers.headers.get("proxy-connection").is_none());
        assert!(headers.headers.get(header::CONNECTION).is_none());
        assert!(headers.headers.get("keep-alive").is_none());
        assert!(headers.headers.get(header::EXPECT).is_none());
        assert!(headers.headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_request_header_edge_cases() {
        let mut headers = RequestHeaders::default();
        headers.apply("Content-Length", "lots");
        headers.apply("Bad Name", "x");
        headers.apply("X-Bad-Value", "line\u{7f}break");

        assert_eq!(headers.content_length, 0);
        assert!(headers.headers.is_empty());
    }

    #[test]
    fn test_parse_http_date() {
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert_eq!(
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT; length=1234").as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert_eq!(
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert_eq!(
            parse_http_date("Sun Nov  6 08:49:37 1994").as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("").is_none());
    }

    #[test]
    fn test_if_modified_since_skipped_when_unparseable() {
        let mut headers = RequestHeaders::default();
        headers.apply("If-Modified-Since", "not a date");
        assert!(headers.headers.get(header::IF_MODIFIED_SINCE).is_none());

        headers.apply("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(headers.headers.get(header::IF_MODIFIED_SINCE).is_some());
    }

    #[tokio::test]
    async fn test_pump_body_streams_in_chunks() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut session = ClientSession::new(server);

        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&body).await.unwrap();
        client.write_all(b"next\n").await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let pumped = pump_body(&mut session, body.len() as u64, tx).await.unwrap();
        assert_eq!(pumped, 20_000);

        let mut received = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= READ_BUFFER_SIZE);
            received.extend(chunk);
            chunks += 1;
        }
        assert!(chunks >= 3);
        assert_eq!(received, body);

        // Bytes after the body are left for the session.
        assert_eq!(session.read_line().await.unwrap().unwrap(), "next");
    }

    #[tokio::test]
    async fn test_pump_body_short_client_body() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let (tx, mut rx) = mpsc::channel(4);
        let err = pump_body(&mut session, 10, tx).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));

        assert_eq!(rx.recv().await.unwrap().unwrap(), b"abc");
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_body_stops_when_receiver_gone() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);
        client.write_all(b"abcdef").await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        assert_eq!(pump_body(&mut session, 6, tx).await.unwrap(), 0);
    }

    #[test]
    fn test_forwarder_builds() {
        assert!(Forwarder::new(DEFAULT_UPSTREAM_TIMEOUT).is_ok());
    }
}
