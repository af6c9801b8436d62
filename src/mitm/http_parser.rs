//! HTTP/1.x line scanner for intercepted client streams
//!
//! The proxy reads the client side one line at a time rather than through a
//! full HTTP library: it needs the raw request line and raw header lines in
//! order to rewrite them, and it needs to hand the very same socket over to
//! TLS after a CONNECT without losing any bytes.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};

use crate::error::{ProxyError, Result};
use crate::request::HttpVersion;

/// Longest request or header line accepted
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Anything a client connection can be: a TCP socket or a TLS stream over one.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

/// Buffered, line-oriented view of a client connection.
///
/// Reads go through the buffer; writes pass straight through to the stream.
pub struct ClientSession {
    reader: BufReader<Box<dyn ClientStream>>,
}

impl ClientSession {
    pub fn new<S: ClientStream + 'static>(stream: S) -> Self {
        Self::from_boxed(Box::new(stream))
    }

    pub fn from_boxed(stream: Box<dyn ClientStream>) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Read one line, without its terminator.
    ///
    /// Lines end at LF; a CR before it is dropped. Returns `None` at EOF
    /// before any byte was read.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;

        if read == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if buf.len() > MAX_LINE_LENGTH {
            return Err(ProxyError::malformed(format!(
                "line exceeds {} bytes",
                MAX_LINE_LENGTH
            )));
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read whatever is available, up to `buf.len()` bytes; 0 means EOF.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf).await?)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.reader.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.reader.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.reader.shutdown().await?;
        Ok(())
    }

    /// Mutable access for writers that wrap the stream.
    pub fn get_mut(&mut self) -> &mut BufReader<Box<dyn ClientStream>> {
        &mut self.reader
    }

    /// Give back the raw stream, e.g. to start TLS on it.
    ///
    /// Bytes the client sent past the last line read (a pipelined
    /// ClientHello) are read again from the returned stream first.
    pub fn into_inner(self) -> Box<dyn ClientStream> {
        let buffered = self.reader.buffer().to_vec();
        let inner = self.reader.into_inner();
        if buffered.is_empty() {
            return inner;
        }
        Box::new(ReplayStream {
            buffered,
            position: 0,
            inner,
        })
    }
}

/// Yields leftover buffered bytes before reading the stream again.
struct ReplayStream {
    buffered: Vec<u8>,
    position: usize,
    inner: Box<dyn ClientStream>,
}

impl AsyncRead for ReplayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.position < this.buffered.len() {
            let pending = &this.buffered[this.position..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.position += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// `METHOD TARGET HTTP/x.y`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

impl RequestLine {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        let version = parts
            .next()
            .ok_or_else(|| ProxyError::malformed(format!("request line '{}' has no version", line)))?;

        if method.is_empty() || target.is_empty() {
            return Err(ProxyError::malformed(format!(
                "request line '{}' is incomplete",
                line
            )));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.parse()?,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Split `Name: value` at the first colon.
pub fn parse_header_line(line: &str) -> Result<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ProxyError::malformed(format!("header line '{}' has no colon", line)))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(ProxyError::malformed(format!(
            "header line '{}' has no name",
            line
        )));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse a CONNECT authority `host:port`; the port defaults to 443.
///
/// IPv6 literals must be bracketed (`[::1]:443`); brackets are removed from
/// the returned host.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') || host.starts_with('[') => {
            let port: u16 = port.parse().map_err(|_| {
                ProxyError::malformed(format!(
                    "invalid port '{}': must be a number between 1 and 65535",
                    port
                ))
            })?;
            if port == 0 {
                return Err(ProxyError::malformed("invalid port: must be between 1 and 65535"));
            }
            (host, port)
        }
        _ => (authority, 443),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(ProxyError::malformed("host cannot be empty"));
    }
    if host.contains(':') && host.parse::<IpAddr>().is_err() {
        return Err(ProxyError::malformed(format!("invalid host '{}'", host)));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let line = RequestLine::parse("GET http://example.com/ HTTP/1.1").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "http://example.com/");
        assert_eq!(line.version, HttpVersion::HTTP_11);
        assert!(!line.is_connect());

        let line = RequestLine::parse("connect example.com:443 HTTP/1.0").unwrap();
        assert!(line.is_connect());
        assert_eq!(line.version, HttpVersion::HTTP_10);
    }

    #[test]
    fn test_parse_request_line_rejects_short_lines() {
        assert!(RequestLine::parse("").is_err());
        assert!(RequestLine::parse("GET").is_err());
        assert!(RequestLine::parse("GET /").is_err());
        assert!(RequestLine::parse("GET / FTP/1.1").is_err());
        assert!(RequestLine::parse(" / HTTP/1.1").is_err());
    }

    #[test]
    fn test_parse_header_line() {
        assert_eq!(
            parse_header_line("Host: example.com").unwrap(),
            ("Host".to_string(), "example.com".to_string())
        );
        assert_eq!(
            parse_header_line("X-Time: 12:30:00").unwrap(),
            ("X-Time".to_string(), "12:30:00".to_string())
        );
        assert_eq!(
            parse_header_line("Empty:").unwrap(),
            ("Empty".to_string(), String::new())
        );
        assert!(parse_header_line("no colon here").is_err());
        assert!(parse_header_line(": value").is_err());
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(parse_authority("[::1]:443").unwrap(), ("::1".to_string(), 443));
    }

    #[test]
    fn test_parse_authority_rejects_invalid() {
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:99999").is_err());
        assert!(parse_authority("example.com:abc").is_err());
        assert!(parse_authority(":443").is_err());
    }

    #[tokio::test]
    async fn test_read_lines_and_body() {
        let (client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);

        let mut client = client;
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\nlast\r\n\r\nhello")
            .await
            .unwrap();
        drop(client);

        assert_eq!(session.read_line().await.unwrap().unwrap(), "POST / HTTP/1.1");
        assert_eq!(session.read_line().await.unwrap().unwrap(), "Content-Length: 5");
        assert_eq!(session.read_line().await.unwrap().unwrap(), "last");
        assert_eq!(session.read_line().await.unwrap().unwrap(), "");

        let mut body = [0u8; 16];
        let n = session.read_chunk(&mut body).await.unwrap();
        assert_eq!(&body[..n], b"hello");
        assert_eq!(session.read_chunk(&mut body).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_chunk_bounded_by_buffer() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);

        client.write_all(b"abcdefgh").await.unwrap();
        drop(client);

        let mut chunk = [0u8; 3];
        let n = session.read_chunk(&mut chunk).await.unwrap();
        assert_eq!(&chunk[..n], b"abc");
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut session = ClientSession::new(server);

        let line = vec![b'a'; MAX_LINE_LENGTH + 10];
        client.write_all(&line).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
        drop(client);

        let err = session.read_line().await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_into_inner_replays_pipelined_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);

        client.write_all(b"CONNECT a:443 HTTP/1.1\r\n\r\nearly").await.unwrap();
        session.read_line().await.unwrap();
        session.read_line().await.unwrap();

        let mut stream = session.into_inner();
        let mut early = [0u8; 5];
        stream.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        client.write_all(b"late").await.unwrap();
        let mut late = [0u8; 4];
        stream.read_exact(&mut late).await.unwrap();
        assert_eq!(&late, b"late");

        stream.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = ClientSession::new(server);

        session.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        session.flush().await.unwrap();
        drop(session);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "HTTP/1.1 200 OK\r\n\r\n");
    }
}
