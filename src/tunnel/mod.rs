//! Session bridge - ciphered byte relays
//!
//! Provides:
//! - Bidirectional relay between a hijacked client connection and a target
//! - One-way ciphered copy for forwarded response bodies
//! - WebSocket framing for disguised sessions
//! - UDP sockets exposed as byte streams
//! - Token bucket throttling

mod bridge;
mod throttle;
mod udp;
mod websocket;

pub use bridge::Relay;
pub use throttle::Throttle;
pub use udp::UdpBridge;
pub use websocket::{OpCode, WsDecoder, WsFrame};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid throttling parameters: rate {rate}, burst {burst}")]
    InvalidThrottle { rate: u64, burst: u64 },

    #[error("Invalid IV")]
    InvalidIv,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How long a non-partial relay keeps reading to fill its buffer
pub const COALESCE_WINDOW: Duration = Duration::from_millis(2);

/// Per-operation relay parameters, built fresh for every request
#[derive(Debug, Clone, Default)]
pub struct IoConfig {
    /// Optional throttle shared by both directions
    pub bucket: Option<Arc<Throttle>>,
    /// Forward reads as soon as they arrive
    pub partial: bool,
    /// Server-side WebSocket framing on the client side: unmasked frames
    /// out, masked frames in
    pub websocket: bool,
}

impl IoConfig {
    /// Largest chunk a single read may produce
    pub(crate) fn chunk_size(&self) -> usize {
        let size = crate::protocol::RELAY_BUFFER_SIZE;
        match &self.bucket {
            Some(bucket) => size.min(bucket.burst()),
            None => size,
        }
    }
}
