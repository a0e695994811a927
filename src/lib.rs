//! # Webmask
//!
//! Server side of an obfuscating proxy. A single HTTP listener carries
//! tunneled traffic disguised as ordinary web requests:
//!
//! - **CONNECT relaying** over TCP or UDP, optionally dressed up as a
//!   WebSocket upgrade
//! - **Forward HTTP proxying** with ciphered headers and bodies
//! - **DNS resolution** answered in a response header
//!
//! Anything that does not decode as a valid envelope gets the answer an
//! ordinary web server would give.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Server Lifecycle (proxy)              │
//! │      (config, fingerprint byte, listener, serve)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Dispatcher (proxy)                  │
//! │  (envelope decode, auth, DNS / CONNECT / forward)    │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Disguise / Abuse       │   Session Bridge          │
//! │   (fallback, lru)        │   (tunnel: cipher, ws,    │
//! │                          │    udp, throttle)         │
//! ├──────────────────────────┴──────────────────────────┤
//! │        HTTP/1.1 framing (web) over ObfsListener      │
//! │                     (transport)                      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;
pub mod web;

pub use config::{Config, ServerConfig, UserConfig};
pub use proxy::ProxyUpstream;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
