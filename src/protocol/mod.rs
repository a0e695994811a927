//! Protocol definitions and constants

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid HTTP request: {0}")]
    InvalidRequest(String),

    #[error("Header section too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Unsupported Transfer-Encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid chunked body: {0}")]
    InvalidChunk(String),

    #[error("Request body too large: {0} bytes")]
    BodyTooLarge(u64),

    #[error("Invalid WebSocket frame: {0}")]
    InvalidFrame(String),
}

/// Response header carrying a DNS answer (base64 of four IPv4 bytes)
pub const DNS_RESP_HEADER: &str = "ETag";

/// Invalid envelopes from one address before it is reported as abusive
pub const INVALID_REQUEST_RETRY: u64 = 10;

/// Distinct client addresses remembered by the abuse tracker
pub const ABUSE_CACHE_CAPACITY: usize = 128;

/// Maximum size of a request header section (16 KB)
pub const HEADER_SECTION_MAX_LENGTH: usize = 16 * 1024;

/// Maximum number of request headers
pub const MAX_HEADERS: usize = 64;

/// Relay buffer size (32 KB)
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Mask bit forced on the protocol fingerprint byte
pub const FINGERPRINT_MASK: u8 = 0x80;

/// Page served when nothing else matches, identical to a stock nginx 404
pub const NOT_FOUND_PAGE: &str = "<html>
<head><title>404 Not Found</title></head>
<body bgcolor=\"white\">
<center><h1>404 Not Found</h1></center>
<hr><center>nginx</center>
</body>
</html>";

/// Reply to request heads that do not parse, as nginx words it
pub const BAD_REQUEST_PAGE: &str = "<html>
<head><title>400 Bad Request</title></head>
<body>
<center><h1>400 Bad Request</h1></center>
<hr><center>nginx</center>
</body>
</html>";
