//! Request envelope codec
//!
//! Envelope layout, base64url without padding:
//! ```text
//! +----------------+--------------------------+----------------+
//! |  Nonce (16B)   |  Ciphered JSON payload   |  Tag (16B)     |
//! +----------------+--------------------------+----------------+
//! ```
//! The tag is HMAC-SHA256 over nonce and ciphertext, truncated.

use super::{random_bytes, Cipher, CryptoError, Label, NONCE_LEN, TAG_LEN};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation flag set carried by an envelope
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(u32);

impl Options {
    /// Resolve a hostname
    pub const DNS: Options = Options(1);
    /// Relay a raw connection
    pub const CONNECT: Options = Options(1 << 1);
    /// Forward a plain HTTP request
    pub const FORWARD: Options = Options(1 << 2);
    /// Disguise a CONNECT as a WebSocket upgrade
    pub const WEBSOCKET: Options = Options(1 << 3);
    /// Relay UDP instead of TCP
    pub const UDP_RELAY: Options = Options(1 << 4);
    /// Forward partial reads immediately
    pub const PARTIAL: Options = Options(1 << 5);

    pub const fn empty() -> Self {
        Options(0)
    }

    pub fn is_set(self, flag: Options) -> bool {
        flag.0 != 0 && self.0 & flag.0 == flag.0
    }

    /// Primary operation mode, DNS first, then CONNECT, then forward
    pub fn mode(self) -> Mode {
        if self.is_set(Options::DNS) {
            Mode::Dns
        } else if self.is_set(Options::CONNECT) {
            Mode::Connect
        } else if self.is_set(Options::FORWARD) {
            Mode::Forward
        } else {
            Mode::Unknown
        }
    }
}

impl std::ops::BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Options, &str); 6] = [
            (Options::DNS, "DNS"),
            (Options::CONNECT, "CONNECT"),
            (Options::FORWARD, "FORWARD"),
            (Options::WEBSOCKET, "WEBSOCKET"),
            (Options::UDP_RELAY, "UDP_RELAY"),
            (Options::PARTIAL, "PARTIAL"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.is_set(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Options({})", set.join(" | "))
    }
}

/// Mutually exclusive primary modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dns,
    Connect,
    Forward,
    Unknown,
}

/// Decrypted envelope contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Auth token
    #[serde(rename = "a", default)]
    pub auth: String,
    /// Base64 (standard) encoded IV
    #[serde(rename = "i", default)]
    pub iv: String,
    /// Operation flags
    #[serde(rename = "o", default)]
    pub opt: Options,
    /// Hostname for DNS mode
    #[serde(rename = "q", default)]
    pub query: String,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    #[serde(rename = "r")]
    real: String,
    #[serde(flatten)]
    descriptor: RequestDescriptor,
}

impl Cipher {
    /// Encode a destination and descriptor into an envelope token
    pub fn encrypt_host(
        &self,
        destination: &str,
        descriptor: &RequestDescriptor,
    ) -> Result<String, CryptoError> {
        let payload = Payload {
            real: destination.to_string(),
            descriptor: descriptor.clone(),
        };
        let json =
            serde_json::to_vec(&payload).map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let mut buf = vec![0u8; NONCE_LEN];
        random_bytes(&mut buf)?;
        buf.extend_from_slice(&json);

        let (nonce, body) = buf.split_at_mut(NONCE_LEN);
        self.raw_stream(Label::Envelope, nonce).xor_in_place(body);

        let tag = hmac::sign(&self.mac_key, &buf);
        buf.extend_from_slice(&tag.as_ref()[..TAG_LEN]);

        Ok(URL_SAFE_NO_PAD.encode(&buf))
    }

    /// Decode an envelope token
    ///
    /// Scanners hit this with garbage all day, so every failure is `None`.
    pub fn decrypt_host(&self, token: &str) -> Option<(String, RequestDescriptor)> {
        let buf = URL_SAFE_NO_PAD.decode(token).ok()?;
        if buf.len() < NONCE_LEN + TAG_LEN {
            return None;
        }

        let (signed, tag) = buf.split_at(buf.len() - TAG_LEN);
        let expected = hmac::sign(&self.mac_key, signed);
        if !constant_time_eq(&expected.as_ref()[..TAG_LEN], tag) {
            return None;
        }

        let (nonce, body) = signed.split_at(NONCE_LEN);
        let mut body = body.to_vec();
        self.raw_stream(Label::Envelope, nonce).xor_in_place(&mut body);

        let payload: Payload = serde_json::from_slice(&body).ok()?;
        Some((payload.real, payload.descriptor))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extract the envelope token from a request target
///
/// Accepts origin form (`/token/rest?x`) and absolute form
/// (`http://host/token`).
pub fn strip_uri(target: &str) -> &str {
    let path = match target.find("://") {
        Some(i) => {
            let rest = &target[i + 3..];
            rest.find('/').map_or("", |j| &rest[j..])
        }
        None => target,
    };
    let path = path.trim_start_matches('/');
    let end = path.find(|c: char| matches!(c, '/' | '?' | '#')).unwrap_or(path.len());
    &path[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(opt: Options) -> RequestDescriptor {
        RequestDescriptor {
            auth: "alice".to_string(),
            iv: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
            opt,
            query: String::new(),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let cipher = Cipher::new("password");
        let desc = descriptor(Options::CONNECT | Options::PARTIAL);

        let token = cipher.encrypt_host("example.com:443", &desc).unwrap();
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));

        let (dst, decoded) = cipher.decrypt_host(&token).unwrap();
        assert_eq!(dst, "example.com:443");
        assert_eq!(decoded, desc);
    }

    #[test]
    fn test_envelope_is_randomised() {
        let cipher = Cipher::new("password");
        let desc = descriptor(Options::FORWARD);
        let a = cipher.encrypt_host("example.com:80", &desc).unwrap();
        let b = cipher.encrypt_host("example.com:80", &desc).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_noise() {
        let cipher = Cipher::new("password");
        assert!(cipher.decrypt_host("").is_none());
        assert!(cipher.decrypt_host("index.html").is_none());
        assert!(cipher.decrypt_host("wp-login.php").is_none());
        assert!(cipher.decrypt_host(&"A".repeat(200)).is_none());
    }

    #[test]
    fn test_decrypt_rejects_tampering_and_wrong_key() {
        let cipher = Cipher::new("password");
        let token = cipher
            .encrypt_host("example.com:80", &descriptor(Options::FORWARD))
            .unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        raw[NONCE_LEN + 2] ^= 0x01;
        assert!(cipher.decrypt_host(&URL_SAFE_NO_PAD.encode(&raw)).is_none());

        assert!(Cipher::new("other").decrypt_host(&token).is_none());
    }

    #[test]
    fn test_options_mode_precedence() {
        assert_eq!(Options::empty().mode(), Mode::Unknown);
        assert_eq!(Options::WEBSOCKET.mode(), Mode::Unknown);
        assert_eq!((Options::DNS | Options::CONNECT).mode(), Mode::Dns);
        assert_eq!((Options::CONNECT | Options::FORWARD).mode(), Mode::Connect);
        assert_eq!(Options::FORWARD.mode(), Mode::Forward);
        assert!((Options::CONNECT | Options::UDP_RELAY).is_set(Options::UDP_RELAY));
        assert!(!Options::CONNECT.is_set(Options::empty()));
    }

    #[test]
    fn test_strip_uri() {
        assert_eq!(strip_uri("/abc"), "abc");
        assert_eq!(strip_uri("/abc?x=1"), "abc");
        assert_eq!(strip_uri("/abc/def"), "abc");
        assert_eq!(strip_uri("http://server:8100/abc"), "abc");
        assert_eq!(strip_uri("http://server:8100"), "");
        assert_eq!(strip_uri("/"), "");
    }
}
