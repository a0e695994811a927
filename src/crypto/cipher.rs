//! Password-derived cipher context and keyed keystreams
//!
//! Every transform is an XOR with a blake3 keyed XOF seeded by a direction
//! label and the per-request IV, so each direction of a request gets its own
//! keystream and lengths are preserved.

use super::{random_bytes, CryptoError, IV_LEN};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::hmac;
use std::fmt;

const KEY_CONTEXT: &str = "webmask 2026-10 cipher key";
const MAC_CONTEXT: &str = "webmask 2026-10 envelope mac";
const ALIAS_CONTEXT: &str = "webmask 2026-10 alias";

/// Per-value nonce prepended to ciphered header values
const HEADER_NONCE_LEN: usize = 8;

const CONSONANTS: &[u8] = b"bcdfghjklmnprstvwz";
const VOWELS: &[u8] = b"aeiou";

/// Keystream domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Client to server payload
    Upstream,
    /// Server to client payload
    Downstream,
    /// Individual header values
    Header,
    /// The request envelope
    Envelope,
}

impl Label {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Label::Upstream => b"up",
            Label::Downstream => b"down",
            Label::Header => b"header",
            Label::Envelope => b"envelope",
        }
    }
}

/// Stateful keystream; successive calls continue where the last one stopped
pub struct KeyStream {
    reader: blake3::OutputReader,
    scratch: Vec<u8>,
}

impl KeyStream {
    fn new(key: &[u8; 32], label: Label, seed: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(key);
        hasher.update(label.as_bytes());
        hasher.update(&[0]);
        hasher.update(seed);
        Self {
            reader: hasher.finalize_xof(),
            scratch: Vec::new(),
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`
    pub fn xor_in_place(&mut self, data: &mut [u8]) {
        self.scratch.resize(data.len(), 0);
        self.reader.fill(&mut self.scratch);
        for (b, k) in data.iter_mut().zip(self.scratch.iter()) {
            *b ^= k;
        }
    }
}

impl fmt::Debug for KeyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStream").finish_non_exhaustive()
    }
}

/// Shared cipher context derived from the server password
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
    pub(super) mac_key: hmac::Key,
    alias: String,
}

impl Cipher {
    /// Derive the cipher context from a password
    pub fn new(password: &str) -> Self {
        let key = blake3::derive_key(KEY_CONTEXT, password.as_bytes());
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &blake3::derive_key(MAC_CONTEXT, &key));
        let alias = make_alias(&blake3::derive_key(ALIAS_CONTEXT, &key));

        Self {
            key,
            mac_key,
            alias,
        }
    }

    /// Word derived from the key, used to name protocol markers
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Name of the request header carrying the per-request key
    pub fn key_header(&self) -> String {
        format!("X-{}", self.alias)
    }

    /// Keystream for `label` keyed by `iv`
    ///
    /// Returns `None` unless `iv` is exactly [`IV_LEN`] bytes.
    pub fn stream(&self, label: Label, iv: &[u8]) -> Option<KeyStream> {
        if iv.len() != IV_LEN {
            return None;
        }
        Some(KeyStream::new(&self.key, label, iv))
    }

    pub(super) fn raw_stream(&self, label: Label, seed: &[u8]) -> KeyStream {
        KeyStream::new(&self.key, label, seed)
    }

    /// XOR a whole buffer with a fresh keystream; no-op for a bad IV
    pub fn apply(&self, label: Label, iv: &[u8], data: &mut [u8]) {
        if let Some(mut ks) = self.stream(label, iv) {
            ks.xor_in_place(data);
        }
    }

    /// Encrypt a header value so it survives as printable ASCII
    pub fn encrypt_header_value(&self, iv: &[u8], value: &[u8]) -> Result<String, CryptoError> {
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }

        let mut buf = vec![0u8; HEADER_NONCE_LEN + value.len()];
        random_bytes(&mut buf[..HEADER_NONCE_LEN])?;
        buf[HEADER_NONCE_LEN..].copy_from_slice(value);

        let (nonce, body) = buf.split_at_mut(HEADER_NONCE_LEN);
        self.header_stream(iv, nonce).xor_in_place(body);

        Ok(URL_SAFE_NO_PAD.encode(&buf))
    }

    /// Inverse of [`Cipher::encrypt_header_value`]
    pub fn decrypt_header_value(&self, iv: &[u8], value: &str) -> Option<Vec<u8>> {
        if iv.len() != IV_LEN {
            return None;
        }

        let buf = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        if buf.len() < HEADER_NONCE_LEN {
            return None;
        }

        let (nonce, body) = buf.split_at(HEADER_NONCE_LEN);
        let mut body = body.to_vec();
        self.header_stream(iv, nonce).xor_in_place(&mut body);
        Some(body)
    }

    fn header_stream(&self, iv: &[u8], nonce: &[u8]) -> KeyStream {
        let mut seed = Vec::with_capacity(iv.len() + nonce.len());
        seed.extend_from_slice(iv);
        seed.extend_from_slice(nonce);
        KeyStream::new(&self.key, Label::Header, &seed)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

/// Pronounceable six letter word, capitalised, e.g. `Bokeru`
fn make_alias(seed: &[u8; 32]) -> String {
    seed.iter()
        .take(6)
        .enumerate()
        .map(|(i, &b)| {
            let c = if i % 2 == 0 {
                CONSONANTS[b as usize % CONSONANTS.len()]
            } else {
                VOWELS[b as usize % VOWELS.len()]
            };
            if i == 0 {
                c.to_ascii_uppercase() as char
            } else {
                c as char
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IV: [u8; IV_LEN] = [7u8; IV_LEN];

    #[test]
    fn test_alias_is_stable_and_header_safe() {
        let a = Cipher::new("password");
        let b = Cipher::new("password");
        let c = Cipher::new("another password");

        assert_eq!(a.alias(), b.alias());
        assert_ne!(a.alias(), c.alias());
        assert_eq!(a.alias().len(), 6);
        assert!(a.alias().chars().all(|c| c.is_ascii_alphabetic()));
        assert!(http::HeaderName::from_bytes(a.key_header().as_bytes()).is_ok());
    }

    #[test]
    fn test_stream_rejects_bad_iv() {
        let cipher = Cipher::new("password");
        assert!(cipher.stream(Label::Downstream, &[0u8; 15]).is_none());
        assert!(cipher.stream(Label::Downstream, &[0u8; 17]).is_none());
        assert!(cipher.stream(Label::Downstream, &IV).is_some());
    }

    #[test]
    fn test_stream_is_chunk_independent() {
        let cipher = Cipher::new("password");
        let plain = b"The quick brown fox jumps over the lazy dog".to_vec();

        let mut whole = plain.clone();
        cipher.apply(Label::Downstream, &IV, &mut whole);
        assert_ne!(whole, plain);

        let mut chunked = plain.clone();
        let mut ks = cipher.stream(Label::Downstream, &IV).unwrap();
        let (a, b) = chunked.split_at_mut(5);
        ks.xor_in_place(a);
        ks.xor_in_place(b);
        assert_eq!(chunked, whole);

        cipher.apply(Label::Downstream, &IV, &mut whole);
        assert_eq!(whole, plain);
    }

    #[test]
    fn test_directions_use_different_keystreams() {
        let cipher = Cipher::new("password");
        let mut up = [0u8; 32];
        let mut down = [0u8; 32];
        cipher.apply(Label::Upstream, &IV, &mut up);
        cipher.apply(Label::Downstream, &IV, &mut down);
        assert_ne!(up, down);
    }

    #[test]
    fn test_header_value_roundtrip() {
        let cipher = Cipher::new("password");
        let encrypted = cipher.encrypt_header_value(&IV, b"session=abc; Path=/").unwrap();
        assert!(http::HeaderValue::from_str(&encrypted).is_ok());
        assert_eq!(
            cipher.decrypt_header_value(&IV, &encrypted).unwrap(),
            b"session=abc; Path=/"
        );

        let other = Cipher::new("other");
        assert_ne!(
            other.decrypt_header_value(&IV, &encrypted).unwrap(),
            b"session=abc; Path=/"
        );
        assert!(cipher.decrypt_header_value(&IV, "!!").is_none());
    }
}
