//! Proxy server
//!
//! Provides:
//! - The request dispatcher (DNS, CONNECT and forward modes)
//! - The disguise responder for everything that is not proxy traffic
//! - Abuse tracking for peers sending invalid envelopes
//! - Server construction and the accept loop

mod abuse;
mod dispatcher;
mod fallback;
mod server;

pub use abuse::AbuseTracker;
pub use fallback::Disguise;
pub use server::{BoundServer, ProxyUpstream};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid proxy_pass target: {0}")]
    InvalidProxyPass(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Invalid forward destination: {0}")]
    InvalidDestination(String),
}
