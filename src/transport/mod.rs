//! Transport layer
//!
//! Provides the listener the HTTP server runs on. Connections from
//! compatible peers open with a one-byte protocol fingerprint (top bit set,
//! so it can never start an HTTP method); everything else is plain HTTP.

mod listener;

pub use listener::{Incoming, ObfsListener, SessionCounter};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Session bookkeeping hooks called by relays
pub trait SessionObserver: Send + Sync {
    /// A relay session started
    fn on_open(&self);

    /// A relay session ended
    fn on_close(&self);
}
