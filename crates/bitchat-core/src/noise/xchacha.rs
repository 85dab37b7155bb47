//! XChaCha20-Poly1305 with random 24-byte nonces
//!
//! Used for file chunks, where senders sample nonces randomly instead of
//! counting: the 192-bit nonce space makes collisions negligible. The
//! extended nonce derives a subkey via HChaCha20 inside the cipher
//! implementation; callers only see the 24-byte nonce.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::errors::NoiseError;

/// Required key length in bytes
pub const KEY_LEN: usize = 32;

/// Required nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// Encrypt and authenticate `plaintext` with the given key, nonce and AAD
pub fn seal(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = cipher_for(key, nonce)?;
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| NoiseError::AuthenticationFailed)
}

/// Decrypt and verify a ciphertext produced by [`seal`]
///
/// Any modification to ciphertext, tag, key, nonce or AAD fails with
/// [`NoiseError::AuthenticationFailed`].
pub fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = cipher_for(key, nonce)?;
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| NoiseError::AuthenticationFailed)
}

fn cipher_for(key: &[u8], nonce: &[u8]) -> Result<XChaCha20Poly1305, NoiseError> {
    if key.len() != KEY_LEN {
        return Err(NoiseError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    if nonce.len() != NONCE_LEN {
        return Err(NoiseError::InvalidNonceLength {
            expected: NONCE_LEN,
            got: nonce.len(),
        });
    }
    Ok(XChaCha20Poly1305::new(Key::from_slice(key)))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_known_vector() {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 24];
        let plaintext = b"Hello, XChaCha20-Poly1305!";

        let sealed = seal(&key, &nonce, plaintext, b"").unwrap();
        assert_eq!(sealed.len(), plaintext.len() + 16);
        let opened = open(&key, &nonce, &sealed, b"").unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 24];
        let sealed = seal(&key, &nonce, b"Hello, XChaCha20-Poly1305!", b"").unwrap();

        for index in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            assert!(
                matches!(
                    open(&key, &nonce, &tampered, b""),
                    Err(NoiseError::AuthenticationFailed)
                ),
                "byte {index} flip must fail authentication"
            );
        }
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 24];
        let sealed = seal(&key, &nonce, b"secret", b"header").unwrap();

        let mut wrong_key = key;
        wrong_key[0] ^= 0x01;
        assert!(open(&wrong_key, &nonce, &sealed, b"header").is_err());
        assert!(open(&key, &nonce, &sealed, b"other").is_err());
        assert!(open(&key, &nonce, &sealed, b"header").is_ok());
    }

    #[test]
    fn test_length_validation() {
        assert!(matches!(
            seal(&[0u8; 16], &[0u8; 24], b"", b""),
            Err(NoiseError::InvalidKeyLength {
                expected: 32,
                got: 16
            })
        ));
        assert!(matches!(
            seal(&[0u8; 32], &[0u8; 12], b"", b""),
            Err(NoiseError::InvalidNonceLength {
                expected: 24,
                got: 12
            })
        ));
    }

    #[test]
    fn test_distinct_nonces_distinct_ciphertexts() {
        let key = [7u8; 32];
        let first = seal(&key, &[1u8; 24], b"same plaintext", b"").unwrap();
        let second = seal(&key, &[2u8; 24], b"same plaintext", b"").unwrap();
        assert_ne!(first, second);
    }
}
