//! Server construction and lifecycle

use super::{AbuseTracker, Disguise, ProxyError};
use crate::config::{resolve_bind_addr, ServerConfig};
use crate::crypto::{checksum1b, Cipher};
use crate::protocol::FINGERPRINT_MASK;
use crate::transport::{Incoming, ObfsListener, SessionCounter, TransportError};
use crate::tunnel::Relay;
use crate::web::{http_date, HttpConn, Outcome, Response};
use http::StatusCode;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The proxy server: dispatcher state shared by every connection
pub struct ProxyUpstream {
    pub(super) client: reqwest::Client,
    pub(super) disguise: Disguise,
    pub(super) abuse: AbuseTracker,
    pub(super) rkey_header: String,
    pub(super) cipher: Arc<Cipher>,
    pub(super) config: Arc<ServerConfig>,
    pub(super) relay: Arc<Relay>,
    pub(super) upstream_errors: AtomicU64,
    local_addr: String,
    fingerprint: u8,
}

impl ProxyUpstream {
    /// Build a server for `addr` (an address or a bare port)
    pub fn new(addr: &str, config: ServerConfig) -> crate::Result<Self> {
        let cipher = Arc::new(config.cipher());

        // Destinations are arbitrary; the envelope layer carries the security
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::from)?;

        let disguise = Disguise::from_proxy_pass(config.proxy_pass.as_deref())?;
        let fingerprint = checksum1b(cipher.alias().as_bytes()) | FINGERPRINT_MASK;

        Ok(Self {
            client,
            disguise,
            abuse: AbuseTracker::default(),
            rkey_header: cipher.key_header(),
            relay: Arc::new(Relay::new(Arc::clone(&cipher))),
            cipher,
            config: Arc::new(config),
            upstream_errors: AtomicU64::new(0),
            local_addr: resolve_bind_addr(addr),
            fingerprint,
        })
    }

    /// Protocol fingerprint byte compatible clients open connections with
    pub fn fingerprint(&self) -> u8 {
        self.fingerprint
    }

    /// Bind address after bare-port expansion
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn disguise(&self) -> &Disguise {
        &self.disguise
    }

    pub fn abuse_tracker(&self) -> &AbuseTracker {
        &self.abuse
    }

    /// Forwarded requests answered with a status of 400 or above
    pub fn upstream_errors(&self) -> u64 {
        self.upstream_errors.load(Ordering::Relaxed)
    }

    /// Open the listener and wire its session bookkeeping into the relays
    pub async fn bind(self) -> crate::Result<BoundServer> {
        let mut listener = ObfsListener::bind(&self.local_addr, true).await?;
        listener.set_version(self.fingerprint);
        self.relay.set_observer(listener.observer());

        info!(
            "Listening on {} (alias {}, fingerprint {:#04x})",
            listener.local_addr()?,
            self.cipher.alias(),
            self.fingerprint
        );

        Ok(BoundServer {
            upstream: Arc::new(self),
            listener,
        })
    }

    /// Bind and serve until the listener fails
    pub async fn start(self) -> crate::Result<()> {
        self.bind().await?.serve().await
    }

    async fn serve_connection(&self, incoming: Incoming) -> crate::Result<()> {
        let peer = incoming.peer_addr();
        let (stream, marked) = incoming.classify().await?;
        trace!("Serving {} (marked: {})", peer, marked);

        let mut conn = HttpConn::new(stream, Some(peer));
        self.serve_http(&mut conn).await
    }

    /// Run the request loop on one connection until it closes or is hijacked
    pub(super) async fn serve_http<S>(&self, conn: &mut HttpConn<S>) -> crate::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let (request, body) = match conn.next_request().await {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(()),
                Err(crate::Error::Protocol(e)) => {
                    // Unparseable heads get what nginx would send
                    bad_request(conn).await;
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            };

            let keep_alive = request.keep_alive();
            match self.handle(conn, request, body).await {
                Outcome::KeepAlive if keep_alive => continue,
                Outcome::Hijacked => return Ok(()),
                _ => {
                    conn.close().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn bad_request<S>(conn: &mut HttpConn<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = Response::new(StatusCode::BAD_REQUEST)
        .header("Server", "nginx")
        .header("Date", http_date())
        .header("Content-Type", "text/html")
        .header("Connection", "close");
    conn.send(response, crate::protocol::BAD_REQUEST_PAGE.as_bytes())
        .await
        .ok();
    conn.close().await;
}

/// A server whose listener is open
pub struct BoundServer {
    upstream: Arc<ProxyUpstream>,
    listener: ObfsListener,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn upstream(&self) -> Arc<ProxyUpstream> {
        Arc::clone(&self.upstream)
    }

    /// Relay session counters
    pub fn sessions(&self) -> Arc<SessionCounter> {
        self.listener.observer()
    }

    /// Accept connections forever, one task per connection
    ///
    /// Accept errors tied to a single connection are retried with backoff;
    /// anything else ends the server.
    pub async fn serve(self) -> crate::Result<()> {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let incoming = match self.listener.accept().await {
                Ok(incoming) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    incoming
                }
                Err(TransportError::Accept(e)) if is_transient(&e) => {
                    error!("Accept error: {}; retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let upstream = Arc::clone(&self.upstream);
            tokio::spawn(async move {
                let peer = incoming.peer_addr();
                if let Err(e) = upstream.serve_connection(incoming).await {
                    debug!("Connection {} error: {}", peer, e);
                }
            });
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::crypto::{Options, RequestDescriptor, IV_LEN};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn upstream(config: ServerConfig) -> Arc<ProxyUpstream> {
        Arc::new(ProxyUpstream::new("127.0.0.1:0", config).unwrap())
    }

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 5555)))
    }

    fn envelope(cipher: &Cipher, dst: &str, iv: &[u8], opt: Options, query: &str) -> String {
        let descriptor = RequestDescriptor {
            auth: "alice".to_string(),
            iv: STANDARD.encode(iv),
            opt,
            query: query.to_string(),
        };
        cipher.encrypt_host(dst, &descriptor).unwrap()
    }

    /// Feed raw bytes through the request loop and collect the reply
    async fn exchange(server: &Arc<ProxyUpstream>, raw: Vec<u8>) -> Vec<u8> {
        let (mut client, stream) = duplex(64 * 1024);
        client.write_all(&raw).await.unwrap();
        client.shutdown().await.unwrap();

        let server = Arc::clone(server);
        let task = tokio::spawn(async move {
            let mut conn = HttpConn::new(stream, peer());
            server.serve_http(&mut conn).await.ok();
        });

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        out
    }

    #[test]
    fn test_new_expands_bare_port_and_sets_fingerprint() {
        let server = ProxyUpstream::new("8100", ServerConfig::default()).unwrap();
        assert_eq!(server.local_addr(), "0.0.0.0:8100");
        assert_eq!(
            server.fingerprint(),
            checksum1b(server.cipher().alias().as_bytes()) | 0x80
        );
        assert!(server.fingerprint() & 0x80 != 0);
        assert_eq!(server.disguise(), &Disguise::NotFound);
    }

    #[test]
    fn test_new_rejects_bad_proxy_pass() {
        let config = ServerConfig {
            proxy_pass: Some("http://[::1".to_string()),
            ..Default::default()
        };
        assert!(ProxyUpstream::new("0", config).is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let server = ProxyUpstream::new(&addr, ServerConfig::default()).unwrap();
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_gets_disguise_and_is_tracked() {
        let server = upstream(ServerConfig::default());
        let out = exchange(&server, b"GET /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n".to_vec()).await;
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(server.abuse_tracker().hits(Ipv4Addr::new(10, 1, 2, 3).into()), 1);
    }

    #[tokio::test]
    async fn test_short_iv_is_malformed() {
        let server = upstream(ServerConfig::default());
        let token = envelope(server.cipher(), "example.com:80", &[1u8; 8], Options::DNS, "localhost");
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", token).into_bytes();

        let out = exchange(&server, raw).await;
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(server.abuse_tracker().len(), 1);
    }

    #[tokio::test]
    async fn test_dns_failure_answers_loopback() {
        let server = upstream(ServerConfig::default());
        let token = envelope(server.cipher(), "dns", &[3u8; IV_LEN], Options::DNS, "no such host");
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", token).into_bytes();

        let out = String::from_utf8(exchange(&server, raw).await).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("ETag: fwAAAQ==\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_unregistered_user_gets_nothing() {
        let mut config = ServerConfig::default();
        config.users.insert("bob".to_string(), UserConfig::default());
        let server = upstream(config);

        let token = envelope(server.cipher(), "dns", &[3u8; IV_LEN], Options::DNS, "localhost");
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", token).into_bytes();
        assert!(exchange(&server, raw).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_flags_fall_back() {
        let server = upstream(ServerConfig::default());
        let token = envelope(server.cipher(), "example.com:80", &[3u8; IV_LEN], Options::PARTIAL, "");
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", token).into_bytes();

        let out = exchange(&server, raw).await;
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(server.abuse_tracker().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_head_gets_bad_request() {
        let server = upstream(ServerConfig::default());
        let out = exchange(&server, b"\x16\x03\x01\x00\x05hello\r\n\r\n".to_vec()).await;
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_bad_content_length_is_not_pipelined() {
        let server = upstream(ServerConfig::default());
        let out = exchange(
            &server,
            b"POST /a HTTP/1.1\r\nContent-Length: 1x\r\n\r\nGET /smuggled HTTP/1.1\r\n\r\n".to_vec(),
        )
        .await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(text.matches("HTTP/1.1 ").count(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_serves_pipelined_requests() {
        let server = upstream(ServerConfig::default());
        let out = exchange(
            &server,
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n".to_vec(),
        )
        .await;
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 404 Not Found\r\n").count(), 2);
    }
}
