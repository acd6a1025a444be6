//! XChaCha20-Poly1305 helpers shared by the ratchet and key backups.
//!
//! The 24-byte nonce is large enough that random nonces never collide in
//! practice, so callers draw a fresh random nonce per message.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{CryptoRng, RngCore};

/// Symmetric key size.
pub const KEY_LEN: usize = 32;

/// XChaCha20 nonce size.
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag size.
pub const TAG_LEN: usize = 16;

/// AEAD tag verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpenError;

/// Draw a random nonce.
pub(crate) fn random_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
///
/// Output is ciphertext with the 16-byte tag appended.
pub(crate) fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());

    // Encryption only fails for inputs beyond the cipher's length limit
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption failed");
    };

    ciphertext
}

/// Decrypt and verify `ciphertext` (including tag) against `aad`.
pub(crate) fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, OpenError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| OpenError)
}
