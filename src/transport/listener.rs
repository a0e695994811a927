//! Fingerprint-aware TCP listener

use super::{SessionObserver, TransportError};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

/// Session counters shared between the listener and relays
#[derive(Debug, Default)]
pub struct SessionCounter {
    active: AtomicU64,
    total: AtomicU64,
    marked: AtomicU64,
}

impl SessionCounter {
    /// Relay sessions currently running
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Relay sessions started since the listener was bound
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections that opened with the protocol fingerprint
    pub fn marked(&self) -> u64 {
        self.marked.load(Ordering::Relaxed)
    }
}

impl SessionObserver for SessionCounter {
    fn on_open(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_close(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// TCP listener that recognises fingerprinted connections
pub struct ObfsListener {
    listener: TcpListener,
    markable: bool,
    version: u8,
    sessions: Arc<SessionCounter>,
}

impl ObfsListener {
    /// Bind to `addr`; `markable` enables fingerprint detection
    pub async fn bind(addr: &str, markable: bool) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            markable,
            version: 0,
            sessions: Arc::new(SessionCounter::default()),
        })
    }

    /// Set the fingerprint byte compatible peers open with
    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Session bookkeeping for relays running over this listener
    pub fn observer(&self) -> Arc<SessionCounter> {
        Arc::clone(&self.sessions)
    }

    /// Accept the next connection
    ///
    /// Fingerprint detection needs a read, so it is deferred to
    /// [`Incoming::classify`] on the connection's own task.
    pub async fn accept(&self) -> Result<Incoming, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        trace!("Accepted connection from {}", peer);

        Ok(Incoming {
            stream,
            peer,
            version: self.markable.then_some(self.version),
            sessions: Arc::clone(&self.sessions),
        })
    }
}

/// A freshly accepted connection
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    version: Option<u8>,
    sessions: Arc<SessionCounter>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Consume the fingerprint byte if present
    ///
    /// Returns the stream positioned at the first HTTP byte and whether the
    /// connection was marked.
    pub async fn classify(self) -> io::Result<(TcpStream, bool)> {
        let mut stream = self.stream;
        stream.set_nodelay(true).ok();

        let version = match self.version {
            Some(v) => v,
            None => return Ok((stream, false)),
        };

        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 || first[0] != version {
            return Ok((stream, false));
        }

        stream.read_exact(&mut first).await?;
        self.sessions.marked.fetch_add(1, Ordering::Relaxed);
        debug!("Fingerprinted connection from {}", self.peer);
        Ok((stream, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_marked_connection_is_stripped() {
        let mut listener = ObfsListener::bind("127.0.0.1:0", true).await.unwrap();
        listener.set_version(0xA5);
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0xA5, b'G', b'E', b'T']).await.unwrap();
            stream
        });

        let incoming = listener.accept().await.unwrap();
        let (mut stream, marked) = incoming.classify().await.unwrap();
        assert!(marked);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
        assert_eq!(listener.observer().marked(), 1);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_plain_http_is_untouched() {
        let mut listener = ObfsListener::bind("127.0.0.1:0", true).await.unwrap();
        listener.set_version(0xA5);
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET").await.unwrap();
            stream
        });

        let (mut stream, marked) = listener.accept().await.unwrap().classify().await.unwrap();
        assert!(!marked);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
        drop(client.await.unwrap());
    }

    #[test]
    fn test_session_counter() {
        let counter = SessionCounter::default();
        counter.on_open();
        counter.on_open();
        counter.on_close();
        assert_eq!(counter.active(), 1);
        assert_eq!(counter.total(), 2);
    }
}
