//! Request dispatch
//!
//! Every request either decodes as an envelope and is served in one of the
//! proxy modes, or gets the disguise reply. Nothing a prober can observe
//! tells the two apart.

use super::{ProxyError, ProxyUpstream};
use crate::crypto::{strip_uri, Label, Mode, Options, RequestDescriptor, IV_LEN};
use crate::protocol::{DNS_RESP_HEADER, INVALID_REQUEST_RETRY};
use crate::tunnel::{IoConfig, Throttle, UdpBridge};
use crate::web::{
    filter_hop_by_hop_headers, http_date, HttpConn, Outcome, Prebuffered, Request, Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};
use url::Url;

impl ProxyUpstream {
    /// Handle one request
    pub(super) async fn handle<S>(
        &self,
        conn: &mut HttpConn<S>,
        request: Request,
        body: Bytes,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(addr) = conn.remote_addr().map(|a| a.ip()) else {
            warn!("Unknown remote address");
            return self.reply_something(conn, &request, body).await;
        };

        let rkey = request.header(&self.rkey_header).unwrap_or_default().to_string();
        let decoded = self
            .cipher
            .decrypt_host(strip_uri(&request.target))
            .filter(|(dst, _)| !dst.is_empty());

        let Some((dst, descriptor)) = decoded else {
            debug!("Invalid request from: {}", addr);
            self.abuse.add(addr);
            return self.reply_something(conn, &request, body).await;
        };

        let iv = match STANDARD.decode(&descriptor.iv) {
            Ok(iv) if iv.len() == IV_LEN => iv,
            _ => {
                debug!("Invalid key request from: {}", addr);
                self.abuse.add(addr);
                return self.reply_something(conn, &request, body).await;
            }
        };

        if !self.config.users.is_empty() && !self.authorized(&descriptor.auth) {
            warn!("User auth failed, from: {}", addr);
            conn.close().await;
            return Outcome::Close;
        }

        if self.abuse.exceeds(addr, INVALID_REQUEST_RETRY) {
            debug!("Repeated access using invalid key from: {}", addr);
        }

        match descriptor.opt.mode() {
            Mode::Dns => self.resolve(conn, &descriptor.query).await,
            Mode::Connect => self.connect(conn, &dst, &descriptor, iv, &rkey).await,
            Mode::Forward => self.forward(conn, request, body, &dst, &iv).await,
            Mode::Unknown => {
                self.abuse.add(addr);
                self.reply_something(conn, &request, body).await
            }
        }
    }

    /// Any registered user is fully authorized; per-user settings are not
    /// consulted yet
    fn authorized(&self, auth: &str) -> bool {
        self.config.users.contains_key(auth)
    }

    /// Relay parameters for one operation
    ///
    /// A fresh throttle is built per request, so throttling only bounds a
    /// single operation rather than a client.
    fn io_config(&self) -> IoConfig {
        let mut ioc = IoConfig::default();
        if self.config.throttling > 0 {
            match Throttle::new(self.config.throttling, self.config.throttling_max) {
                Ok(bucket) => ioc.bucket = Some(Arc::new(bucket)),
                Err(e) => warn!("Throttling disabled: {}", e),
            }
        }
        ioc
    }

    async fn reply_something<S>(
        &self,
        conn: &mut HttpConn<S>,
        request: &Request,
        body: Bytes,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.disguise.reply(conn, request, body, &self.client).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Disguise reply failed: {}", e);
                Outcome::Close
            }
        }
    }

    async fn resolve<S>(&self, conn: &mut HttpConn<S>, host: &str) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // A failed lookup must look exactly like a successful one
        let ip = lookup_ipv4(host).await.unwrap_or(Ipv4Addr::LOCALHOST);
        debug!("DNS: {} {}", host, ip);

        let response = Response::new(StatusCode::OK)
            .header("Date", http_date())
            .header(DNS_RESP_HEADER, STANDARD.encode(ip.octets()));
        finish(conn.send(response, b"").await)
    }

    async fn connect<S>(
        &self,
        conn: &mut HttpConn<S>,
        host: &str,
        descriptor: &RequestDescriptor,
        iv: Vec<u8>,
        rkey: &str,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("CONNECT {}", host);
        let Some(mut downstream) = conn.hijack() else {
            error!("Hijacking: connection already taken over");
            return Outcome::Close;
        };

        let opt = descriptor.opt;
        let mut ioc = self.io_config();
        ioc.partial = opt.is_set(Options::PARTIAL);

        let head = if opt.is_set(Options::WEBSOCKET) {
            ioc.websocket = true;
            format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_token(rkey)
            )
        } else {
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nDate: {}\r\n\r\n",
                http_date()
            )
        };

        if opt.is_set(Options::UDP_RELAY) {
            if self.config.disable_udp {
                warn!("Client is trying to send UDP data but UDP relay is disabled");
                downstream.shutdown().await.ok();
                return Outcome::Hijacked;
            }

            match dial_udp(host).await {
                Ok(target) => self.launch(downstream, target, head, iv, ioc).await,
                Err(e) => {
                    error!("UDP dial {}: {}", host, e);
                    downstream.shutdown().await.ok();
                    Outcome::Hijacked
                }
            }
        } else {
            match TcpStream::connect(host).await {
                Ok(target) => {
                    target.set_nodelay(true).ok();
                    self.launch(downstream, target, head, iv, ioc).await
                }
                Err(e) => {
                    error!("Dial {}: {}", host, e);
                    downstream.shutdown().await.ok();
                    Outcome::Hijacked
                }
            }
        }
    }

    /// Write the synthetic response head, then hand both connections to a
    /// detached bridge task
    async fn launch<S, T>(
        &self,
        mut downstream: Prebuffered<S>,
        target: T,
        head: String,
        iv: Vec<u8>,
        ioc: IoConfig,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = downstream.write_all(head.as_bytes()).await {
            debug!("Writing CONNECT response: {}", e);
            return Outcome::Hijacked;
        }

        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            match relay.bridge(downstream, target, &iv, ioc).await {
                Ok((up, down)) => trace!(up, down, "Bridge closed"),
                Err(e) => debug!("Bridge error: {}", e),
            }
        });
        Outcome::Hijacked
    }

    async fn forward<S>(
        &self,
        conn: &mut HttpConn<S>,
        request: Request,
        body: Bytes,
        dst: &str,
        iv: &[u8],
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let url = match forward_url(dst) {
            Ok(url) => url,
            Err(e) => {
                debug!("{}", e);
                return self.reply_something(conn, &request, body).await;
            }
        };

        let mut headers = request.headers.clone();
        self.decrypt_cookies(&mut headers, iv);
        headers.remove(self.rkey_header.as_str());
        filter_hop_by_hop_headers(&mut headers);
        headers.remove(header::HOST);

        let mut body = body.to_vec();
        self.cipher.apply(Label::Upstream, iv, &mut body);

        debug!("{} {}", request.method, url);
        let result = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("HTTP forward: {}, {}", url, e);
                let mut text = e.to_string().into_bytes();
                self.cipher.apply(Label::Downstream, iv, &mut text);
                return finish(
                    conn.send(Response::new(StatusCode::INTERNAL_SERVER_ERROR), &text)
                        .await,
                );
            }
        };

        let status = upstream.status();
        if status.as_u16() >= 400 {
            self.upstream_errors.fetch_add(1, Ordering::Relaxed);
            debug!("[{}] - {}", status, url);
        }

        let mut headers = upstream.headers().clone();
        filter_hop_by_hop_headers(&mut headers);
        self.encrypt_set_cookies(&mut headers, iv);
        let known_length = headers.contains_key(header::CONTENT_LENGTH);

        if let Err(e) = conn.send_head(&Response { status, headers }).await {
            debug!("Writing forward response head: {}", e);
            return Outcome::Close;
        }
        if request.method == Method::HEAD {
            return Outcome::KeepAlive;
        }

        let writer = match conn.writer() {
            Ok(writer) => writer,
            Err(_) => return Outcome::Close,
        };
        let stream = Box::pin(upstream.bytes_stream().map_err(io::Error::other));
        match self
            .relay
            .copy(writer, stream, iv, self.io_config())
            .await
        {
            Ok(_) if known_length => Outcome::KeepAlive,
            Ok(_) => Outcome::Close,
            Err(e) => {
                error!("Copy response of {}: {}", url, e);
                Outcome::Close
            }
        }
    }

    /// Cookie values arrive ciphered; ones that do not decrypt are dropped
    fn decrypt_cookies(&self, headers: &mut HeaderMap, iv: &[u8]) {
        let cookies: Vec<HeaderValue> = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| {
                let plain = self.cipher.decrypt_header_value(iv, v.to_str().ok()?)?;
                HeaderValue::from_bytes(&plain).ok()
            })
            .collect();

        headers.remove(header::COOKIE);
        for cookie in cookies {
            headers.append(header::COOKIE, cookie);
        }
    }

    fn encrypt_set_cookies(&self, headers: &mut HeaderMap, iv: &[u8]) {
        let cookies: Vec<HeaderValue> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| {
                let sealed = self.cipher.encrypt_header_value(iv, v.as_bytes()).ok()?;
                HeaderValue::from_str(&sealed).ok()
            })
            .collect();

        headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            headers.append(header::SET_COOKIE, cookie);
        }
    }
}

fn finish(result: io::Result<()>) -> Outcome {
    match result {
        Ok(()) => Outcome::KeepAlive,
        Err(e) => {
            debug!("Writing response: {}", e);
            Outcome::Close
        }
    }
}

/// The `Sec-WebSocket-Accept` value for a disguised upgrade
///
/// Derived from the echoed key header only, so it is stable for a given key.
pub(crate) fn accept_token(rkey: &str) -> String {
    rkey.chars().chain(rkey.chars()).skip(4).take(28).collect()
}

/// Forward destination: absolute URLs as is, bare authorities over http
fn forward_url(dst: &str) -> Result<Url, ProxyError> {
    let candidate = if dst.contains("://") {
        dst.to_string()
    } else {
        format!("http://{}/", dst)
    };
    Url::parse(&candidate).map_err(|e| ProxyError::InvalidDestination(format!("{}: {}", dst, e)))
}

async fn lookup_ipv4(host: &str) -> Option<Ipv4Addr> {
    if host.is_empty() || host.len() > 253 || host.contains(char::is_whitespace) {
        return None;
    }

    match tokio::net::lookup_host((host, 0)).await {
        Ok(addrs) => addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next(),
        Err(e) => {
            warn!("DNS lookup {}: {}", host, e);
            None
        }
    }
}

async fn dial_udp(host: &str) -> io::Result<UdpBridge> {
    let remote = tokio::net::lookup_host(host)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))?;
    UdpBridge::connect(remote).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_token_is_deterministic() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(accept_token(key), accept_token(key));
        assert_eq!(accept_token(key), "IHNhbXBsZSBub25jZQ==dGhlIHNh");
        assert_eq!(accept_token("abc"), "bc");
        assert_eq!(accept_token("abcdef"), "efabcdef");
    }

    #[test]
    fn test_forward_url() {
        assert_eq!(
            forward_url("example.com:8080").unwrap().as_str(),
            "http://example.com:8080/"
        );
        assert_eq!(
            forward_url("https://example.com/a?b=1").unwrap().as_str(),
            "https://example.com/a?b=1"
        );
        assert!(forward_url("exa mple.com").is_err());
    }

    #[tokio::test]
    async fn test_lookup_rejects_malformed_names() {
        assert_eq!(lookup_ipv4("").await, None);
        assert_eq!(lookup_ipv4("no such host").await, None);
        assert_eq!(lookup_ipv4("127.0.0.1").await, Some(Ipv4Addr::LOCALHOST));
    }
}
