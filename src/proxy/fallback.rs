//! Disguise responder
//!
//! Whatever is not proxy traffic gets the answer an ordinary web server
//! would give: a reverse-proxied site, a static file tree, or nginx's 404.

use super::ProxyError;
use crate::protocol::NOT_FOUND_PAGE;
use crate::web::{filter_hop_by_hop_headers, http_date, HttpConn, Outcome, Request, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderValue, Method, StatusCode};
use percent_encoding::percent_decode_str;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

/// What unrecognised requests are answered with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disguise {
    /// The stock nginx 404 page
    NotFound,
    /// Files under a directory
    Static(PathBuf),
    /// A single upstream site
    ReverseProxy(Url),
}

impl Disguise {
    /// Build from the `proxy_pass` setting
    ///
    /// Anything starting with `http` is a reverse proxy target, anything else
    /// a directory.
    pub fn from_proxy_pass(target: Option<&str>) -> Result<Self, ProxyError> {
        match target.map(str::trim) {
            None | Some("") => Ok(Disguise::NotFound),
            Some(t) if t.starts_with("http") => Url::parse(t)
                .map(Disguise::ReverseProxy)
                .map_err(|e| ProxyError::InvalidProxyPass(format!("{}: {}", t, e))),
            Some(t) => Ok(Disguise::Static(PathBuf::from(t))),
        }
    }

    /// Answer `request` the way the disguise would
    ///
    /// Returns [`Outcome::Close`] when the reply was delimited by closing the
    /// connection or was cut short.
    pub async fn reply<S>(
        &self,
        conn: &mut HttpConn<S>,
        request: &Request,
        body: Bytes,
        client: &reqwest::Client,
    ) -> io::Result<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Disguise::NotFound => not_found(conn, request).await.map(|()| Outcome::KeepAlive),
            Disguise::Static(root) => serve_file(conn, request, root).await,
            Disguise::ReverseProxy(base) => reverse_proxy(conn, request, body, base, client).await,
        }
    }
}

async fn not_found<S>(conn: &mut HttpConn<S>, request: &Request) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = Response::new(StatusCode::NOT_FOUND)
        .header("Server", "nginx")
        .header("Date", http_date())
        .header("Content-Type", "text/html");
    send(conn, &request.method, response, NOT_FOUND_PAGE.as_bytes()).await
}

/// Send a response, omitting the body for `HEAD`
async fn send<S>(
    conn: &mut HttpConn<S>,
    method: &Method,
    mut response: Response,
    body: &[u8],
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if method == Method::HEAD {
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        conn.send_head(&response).await
    } else {
        conn.send(response, body).await
    }
}

async fn serve_file<S>(
    conn: &mut HttpConn<S>,
    request: &Request,
    root: &Path,
) -> io::Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keep_alive = Outcome::KeepAlive;
    if request.method != Method::GET && request.method != Method::HEAD {
        return not_found(conn, request).await.map(|()| keep_alive);
    }

    let Some(mut path) = resolve_path(root, origin_path(&request.target)) else {
        debug!("Rejected static path {}", request.target);
        return not_found(conn, request).await.map(|()| keep_alive);
    };
    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
        path.push("index.html");
    }

    let opened = match tokio::fs::File::open(&path).await {
        Ok(file) => file.metadata().await.map(|m| (file, m)),
        Err(e) => Err(e),
    };
    let (mut file, len) = match opened {
        Ok((file, meta)) if meta.is_file() => (file, meta.len()),
        _ => return not_found(conn, request).await.map(|()| keep_alive),
    };

    let mut response = Response::new(StatusCode::OK)
        .header("Server", "nginx")
        .header("Date", http_date())
        .header("Content-Type", content_type(&path));
    response
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    conn.send_head(&response).await?;
    if request.method == Method::HEAD {
        return Ok(keep_alive);
    }

    let writer = conn.writer()?;
    let copied = tokio::io::copy(&mut (&mut file).take(len), writer).await?;
    writer.flush().await?;
    if copied != len {
        // The file shrank after its length went out
        debug!("Short read of {}: {} of {} bytes", path.display(), copied, len);
        return Ok(Outcome::Close);
    }
    Ok(keep_alive)
}

async fn reverse_proxy<S>(
    conn: &mut HttpConn<S>,
    request: &Request,
    body: Bytes,
    base: &Url,
    client: &reqwest::Client,
) -> io::Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let url = join_url(base, origin_path(&request.target));

    let mut headers = request.headers.clone();
    filter_hop_by_hop_headers(&mut headers);
    headers.remove(header::HOST);

    let upstream = match client
        .request(request.method.clone(), url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            debug!("Disguise upstream {} failed: {}", url, e);
            let response = Response::new(StatusCode::BAD_GATEWAY)
                .header("Server", "nginx")
                .header("Date", http_date());
            return conn.send(response, b"").await.map(|()| Outcome::KeepAlive);
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    filter_hop_by_hop_headers(&mut headers);

    // Without a length the body runs until the connection closes
    let delimited = headers.contains_key(header::CONTENT_LENGTH)
        || request.method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    if !delimited {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    conn.send_head(&Response { status, headers }).await?;
    if request.method == Method::HEAD {
        return Ok(Outcome::KeepAlive);
    }

    let writer = conn.writer()?;
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => writer.write_all(&chunk).await?,
            Err(e) => {
                debug!("Disguise upstream {} body: {}", url, e);
                return Ok(Outcome::Close);
            }
        }
    }
    writer.flush().await?;

    Ok(if delimited {
        Outcome::KeepAlive
    } else {
        Outcome::Close
    })
}

/// Path and query of a request target, in origin form
fn origin_path(target: &str) -> &str {
    match target.find("://") {
        Some(i) => {
            let rest = &target[i + 3..];
            rest.find('/').map_or("/", |j| &rest[j..])
        }
        None => target,
    }
}

/// Append a request path and query to the reverse proxy base
fn join_url(base: &Url, target: &str) -> Url {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    url
}

/// Map a request path onto `root`, refusing to leave it
///
/// Segments are percent-decoded before they are checked.
fn resolve_path(root: &Path, target: &str) -> Option<PathBuf> {
    let end = target
        .find(|c: char| matches!(c, '?' | '#'))
        .unwrap_or(target.len());

    let mut resolved = root.to_path_buf();
    for raw in target[..end].split('/') {
        let segment = percent_decode_str(raw).decode_utf8().ok()?;
        match segment.as_ref() {
            "" | "." => continue,
            ".." => return None,
            s if s.contains(['/', '\\', '\0']) => return None,
            s => resolved.push(s),
        }
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "text/xml; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
