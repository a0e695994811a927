//! Minimal HTTP/1.1 framing
//!
//! The server reads request heads itself instead of going through a full
//! HTTP stack, because CONNECT sessions take over the raw connection right
//! after the head and must not lose bytes the client already sent.

mod prebuffered;

pub use prebuffered::Prebuffered;

use crate::protocol::{ProtocolError, HEADER_SECTION_MAX_LENGTH, MAX_HEADERS};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request body read into memory (64 MB)
pub const MAX_REQUEST_BODY: u64 = 64 * 1024 * 1024;

/// Headers that only concern a single hop (RFC 9110 section 7.6.1)
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Current time in IMF-fixdate form, as used by the `Date` header
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Parsed request head
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as sent
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl Request {
    /// Read the next request head from `reader`
    ///
    /// Returns `Ok(None)` when the peer closed the connection between
    /// requests.
    pub async fn read<S: AsyncRead + Unpin>(
        reader: &mut Prebuffered<S>,
    ) -> crate::Result<Option<Self>> {
        loop {
            if let Some((len, request)) = Self::parse(reader.buffer())? {
                reader.discard(len);
                return Ok(Some(request));
            }
            if reader.is_full() {
                return Err(ProtocolError::HeaderTooLarge(HEADER_SECTION_MAX_LENGTH).into());
            }
            if reader.buffer_more().await? == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Parse a request head, `None` when incomplete
    ///
    /// Returns the length of the head and the request.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req
            .parse(buf)
            .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| ProtocolError::InvalidRequest("invalid method".to_string()))?;
        let target = req
            .path
            .ok_or_else(|| ProtocolError::InvalidRequest("missing target".to_string()))?
            .to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));

        Ok(Some((
            len,
            Self {
                method,
                target,
                version,
                headers,
            },
        )))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// How the request body is delimited
    ///
    /// Conflicting or malformed framing is an error rather than a guess, so
    /// body bytes can never be read as the next request.
    pub fn body_framing(&self) -> Result<BodyFraming, ProtocolError> {
        let mut lengths = self
            .headers
            .get_all(header::CONTENT_LENGTH)
            .iter()
            .flat_map(|v| v.as_bytes().split(|&b| b == b','))
            .map(|v| {
                std::str::from_utf8(v)
                    .ok()
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| {
                        ProtocolError::InvalidContentLength(String::from_utf8_lossy(v).into_owned())
                    })
            })
            .collect::<Result<Vec<u64>, _>>()?;
        lengths.dedup();
        if lengths.len() > 1 {
            return Err(ProtocolError::InvalidContentLength(format!("conflicting {:?}", lengths)));
        }
        let length = lengths.pop();

        let encodings: Vec<String> = self
            .headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .flat_map(|v| v.to_str().unwrap_or("?").split(','))
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        match (encodings.as_slice(), length) {
            ([], None) | ([], Some(0)) => Ok(BodyFraming::Empty),
            ([], Some(len)) if len > MAX_REQUEST_BODY => Err(ProtocolError::BodyTooLarge(len)),
            ([], Some(len)) => Ok(BodyFraming::Length(len)),
            ([only], None) if only == "chunked" => Ok(BodyFraming::Chunked),
            (_, Some(_)) => Err(ProtocolError::InvalidContentLength(
                "sent together with Transfer-Encoding".to_string(),
            )),
            (codings, None) => Err(ProtocolError::UnsupportedEncoding(codings.join(", "))),
        }
    }

    /// Whether the client wants the connection kept open
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .header(header::CONNECTION.as_str())
            .map(|v| v.to_ascii_lowercase());
        match self.version {
            Version::HTTP_10 => connection.is_some_and(|v| v.contains("keep-alive")),
            _ => !connection.is_some_and(|v| v.contains("close")),
        }
    }
}

/// Request body delimiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// Read a `Content-Length` delimited body
///
/// The buffer grows as bytes arrive, never from the claimed length.
pub async fn read_body<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
    len: u64,
) -> io::Result<Bytes> {
    let mut body = Vec::new();
    (&mut *reader).take(len).read_to_end(&mut body).await?;
    if body.len() as u64 != len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(body.into())
}

/// Read and decode a chunked body, dropping any trailers
pub async fn read_chunked<S: AsyncRead + Unpin>(
    reader: &mut Prebuffered<S>,
) -> crate::Result<Bytes> {
    let mut body = Vec::new();
    loop {
        let (line, size) = loop {
            match httparse::parse_chunk_size(reader.buffer()) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => {}
                Err(_) => return Err(ProtocolError::InvalidChunk("bad chunk size".to_string()).into()),
            }
            let want = reader.buffer().len() + 1;
            fill(reader, want).await?;
        };
        reader.discard(line);

        if size == 0 {
            return read_trailers(reader).await.map(|()| body.into());
        }
        let total = body.len() as u64 + size;
        if total > MAX_REQUEST_BODY {
            return Err(ProtocolError::BodyTooLarge(total).into());
        }

        let start = body.len();
        (&mut *reader).take(size).read_to_end(&mut body).await?;
        if (body.len() - start) as u64 != size {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        fill(reader, 2).await?;
        if &reader.buffer()[..2] != b"\r\n" {
            return Err(ProtocolError::InvalidChunk("missing chunk terminator".to_string()).into());
        }
        reader.discard(2);
    }
}

async fn read_trailers<S: AsyncRead + Unpin>(reader: &mut Prebuffered<S>) -> crate::Result<()> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let parsed = match httparse::parse_headers(reader.buffer(), &mut headers) {
            Ok(httparse::Status::Complete((len, _))) => Some(len),
            Ok(httparse::Status::Partial) => None,
            Err(e) => return Err(ProtocolError::InvalidChunk(e.to_string()).into()),
        };
        if let Some(len) = parsed {
            reader.discard(len);
            return Ok(());
        }
        let want = reader.buffer().len() + 1;
        fill(reader, want).await?;
    }
}

/// Buffer until at least `n` bytes are available
async fn fill<S: AsyncRead + Unpin>(reader: &mut Prebuffered<S>, n: usize) -> crate::Result<()> {
    while reader.buffer().len() < n {
        if reader.is_full() {
            return Err(ProtocolError::InvalidChunk("chunk line too long".to_string()).into());
        }
        if reader.buffer_more().await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
    Ok(())
}

/// Response head
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Add a header, silently skipping values that are not valid
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_ref().as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Formats a status line suitable for an HTTP/1.1 response.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        )
    }

    /// Serialise the head, including the terminating blank line
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = self.status_line().into_bytes();
        for (key, value) in self.headers.iter() {
            out.extend_from_slice(title_case(key.as_str()).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub async fn write_head(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        writer.write_all(&self.head_bytes()).await
    }
}

/// `content-type` -> `Content-Type`, the way stock servers spell it
fn title_case(name: &str) -> String {
    if name == "etag" {
        return "ETag".to_string();
    }
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper { c.to_ascii_uppercase() } else { c };
            upper = c == '-';
            out
        })
        .collect()
}

/// Outcome of handling one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A complete response was written, more requests may follow
    KeepAlive,
    /// Stop serving this connection
    Close,
    /// The raw connection was taken over
    Hijacked,
}

/// One HTTP connection as seen by request handlers
#[derive(Debug)]
pub struct HttpConn<S> {
    io: Option<Prebuffered<S>>,
    remote: Option<SocketAddr>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpConn<S> {
    pub fn new(stream: S, remote: Option<SocketAddr>) -> Self {
        Self {
            io: Some(Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH)),
            remote,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_hijacked(&self) -> bool {
        self.io.is_none()
    }

    /// Read the next request head and its body
    pub async fn next_request(&mut self) -> crate::Result<Option<(Request, Bytes)>> {
        let io = self.io.as_mut().ok_or(io::Error::from(io::ErrorKind::NotConnected))?;
        let request = match Request::read(io).await? {
            Some(request) => request,
            None => return Ok(None),
        };

        let body = match request.body_framing()? {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(len) => read_body(io, len).await?,
            BodyFraming::Chunked => read_chunked(io).await?,
        };
        Ok(Some((request, body)))
    }

    /// Write a complete response with a `Content-Length` body
    pub async fn send(&mut self, mut response: Response, body: &[u8]) -> io::Result<()> {
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        let io = self.writer()?;
        let mut out = response.head_bytes();
        out.extend_from_slice(body);
        io.write_all(&out).await?;
        io.flush().await
    }

    /// Write only the response head; the caller streams the body
    pub async fn send_head(&mut self, response: &Response) -> io::Result<()> {
        let io = self.writer()?;
        response.write_head(io).await?;
        io.flush().await
    }

    /// The connection for streaming a body after [`HttpConn::send_head`]
    pub fn writer(&mut self) -> io::Result<&mut Prebuffered<S>> {
        self.io
            .as_mut()
            .ok_or(io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Take the raw connection, including bytes read past the request head
    ///
    /// Returns `None` if it was already taken.
    pub fn hijack(&mut self) -> Option<Prebuffered<S>> {
        self.io.take()
    }

    /// Close the connection without writing anything
    pub async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.shutdown().await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_parse_request_head() {
        let buf = b"GET /abc?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nxyz";
        let (len, req) = Request::parse(buf).unwrap().unwrap();
        assert_eq!(len, buf.len() - 3);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.target, "/abc?x=1");
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Length(3));
        assert!(req.keep_alive());
    }

    #[test]
    fn test_parse_partial_and_garbage() {
        assert!(Request::parse(b"GET / HTTP/1.1\r\nHost:").unwrap().is_none());
        assert!(Request::parse(b"\x16\x03\x01\x02\x00").is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let (_, req) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!req.keep_alive());
        let (_, req) = Request::parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.keep_alive());
        let (_, req) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_filter_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("cookie", HeaderValue::from_static("a=b"));
        filter_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("cookie"));
    }

    #[tokio::test]
    async fn test_pipelined_requests_and_hijack_keeps_tail() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(
                b"POST /a HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /b HTTP/1.1\r\n\r\nraw-bytes",
            )
            .await
            .unwrap();

        let mut conn = HttpConn::new(server, None);
        let (first, body) = conn.next_request().await.unwrap().unwrap();
        assert_eq!(first.target, "/a");
        assert_eq!(&body[..], b"body");

        let (second, body) = conn.next_request().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert!(body.is_empty());

        let raw = conn.hijack().unwrap();
        assert!(conn.is_hijacked());
        assert!(conn.hijack().is_none());
        let (rest, _) = raw.into_parts();
        assert_eq!(&rest[..], b"raw-bytes");
    }

    #[tokio::test]
    async fn test_chunked_body_is_decoded() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(
                b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Checksum: 1\r\n\r\n\
                  GET /b HTTP/1.1\r\n\r\n",
            )
            .await
            .unwrap();

        let mut conn = HttpConn::new(server, None);
        let (first, body) = conn.next_request().await.unwrap().unwrap();
        assert_eq!(first.body_framing().unwrap(), BodyFraming::Chunked);
        assert_eq!(&body[..], b"Wikipedia");

        let (second, body) = conn.next_request().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_length_is_not_trusted() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 60000000\r\n\r\nabc")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut conn = HttpConn::new(server, None);
        assert!(matches!(
            conn.next_request().await,
            Err(crate::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .await
            .unwrap();
        let mut conn = HttpConn::new(server, None);
        assert!(matches!(
            conn.next_request().await,
            Err(crate::Error::Protocol(ProtocolError::InvalidChunk(_)))
        ));
    }

    #[test]
    fn test_ambiguous_framing_is_rejected() {
        let framing = |raw: &[u8]| Request::parse(raw).unwrap().unwrap().1.body_framing();

        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: 1x\r\n\r\n"),
            Err(ProtocolError::InvalidContentLength(_))
        ));
        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n"),
            Err(ProtocolError::InvalidContentLength(_))
        ));
        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: +3\r\n\r\n"),
            Err(ProtocolError::InvalidContentLength(_))
        ));
        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n"),
            Err(ProtocolError::InvalidContentLength(_))
        ));
        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n"),
            Err(ProtocolError::UnsupportedEncoding(_))
        ));
        assert!(matches!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n"),
            Err(ProtocolError::BodyTooLarge(_))
        ));

        // Repeating the same length is harmless
        assert_eq!(
            framing(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\n").unwrap(),
            BodyFraming::Length(3)
        );
        assert_eq!(framing(b"GET / HTTP/1.1\r\n\r\n").unwrap(), BodyFraming::Empty);
    }

    #[tokio::test]
    async fn test_send_sets_content_length() {
        let (mut client, server) = duplex(4096);
        let mut conn = HttpConn::new(server, None);
        conn.send(Response::new(StatusCode::NOT_FOUND).header("Server", "nginx"), b"nope")
            .await
            .unwrap();
        drop(conn);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.contains("Server: nginx\r\n"));
        assert!(out.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }
}
