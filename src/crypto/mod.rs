//! Cryptographic primitives for Webmask
//!
//! This module provides:
//! - The password-derived [`Cipher`] context and its alias
//! - Keyed keystreams (blake3 XOF) applied to headers, bodies and relays
//! - The request envelope codec hiding destination, auth and flags in a URI
//! - Secure random number generation

mod cipher;
mod envelope;

pub use cipher::{Cipher, KeyStream, Label};
pub use envelope::{strip_uri, Mode, Options, RequestDescriptor};

use thiserror::Error;

/// Length of the per-request initialization vector in bytes
pub const IV_LEN: usize = 16;

/// Length of the envelope nonce in bytes
pub const NONCE_LEN: usize = 16;

/// Length of the truncated envelope authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid IV length: {0}")]
    InvalidIvLength(usize),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Random source failure")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// One-byte rolling checksum
pub fn checksum1b(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_mul(31).wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_checksum1b() {
        assert_eq!(checksum1b(b""), 0);
        assert_eq!(checksum1b(b"a"), b'a');
        assert_eq!(checksum1b(b"ab"), b'a'.wrapping_mul(31).wrapping_add(b'b'));
        assert_ne!(checksum1b(b"ab"), checksum1b(b"ba"));
    }
}
