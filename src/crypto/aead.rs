//! AEAD encryption for cookie replies
//!
//! Cookies travel encrypted under XChaCha20-Poly1305 with the received
//! MAC1 as additional data, binding the reply to the initiation that
//! provoked it.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Encrypt using XChaCha20-Poly1305 (used for cookie encryption)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .encrypt(
            xnonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("encrypting an in-memory buffer cannot fail")
}

/// Decrypt using XChaCha20-Poly1305 (used for cookie decryption)
///
/// Returns an error on any authentication tag mismatch.
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(nonce);

    cipher
        .decrypt(
            xnonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [0u8; 32];
        let nonce = [0u8; 24];
        let plaintext = b"Cookie data";
        let aad = b"mac1";

        let ciphertext = xencrypt(&key, &nonce, plaintext, aad);
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = xdecrypt(&key, &nonce, &ciphertext, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_xdecrypt_wrong_key() {
        let key = [0u8; 32];
        let wrong_key = [1u8; 32];
        let nonce = [2u8; 24];

        let ciphertext = xencrypt(&key, &nonce, b"secret", b"aad");
        assert!(xdecrypt(&wrong_key, &nonce, &ciphertext, b"aad").is_err());
    }

    #[test]
    fn test_xdecrypt_wrong_aad() {
        let key = [0u8; 32];
        let nonce = [2u8; 24];

        let ciphertext = xencrypt(&key, &nonce, b"secret", b"correct aad");
        assert!(xdecrypt(&key, &nonce, &ciphertext, b"wrong aad").is_err());
    }

    #[test]
    fn test_xdecrypt_truncated_ciphertext() {
        let key = [0u8; 32];
        let nonce = [0u8; 24];
        assert!(xdecrypt(&key, &nonce, &[0u8; TAG_LEN - 1], b"").is_err());
    }
}
