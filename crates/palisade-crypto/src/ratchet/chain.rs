//! Root and chain key derivation for the Double Ratchet.
//!
//! Chain keys advance through HMAC-SHA256 keyed by the chain key, with input
//! `0x01` for the message key and `0x02` for the next chain key. Root keys
//! advance through HKDF-SHA256 over a fresh Diffie-Hellman output.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use super::ROOT_KDF_INFO;

type HmacSha256 = Hmac<Sha256>;

/// HMAC input for deriving a message key
const MESSAGE_KEY_TAG: &[u8] = &[0x01];

/// HMAC input for deriving the next chain key
const CHAIN_KEY_TAG: &[u8] = &[0x02];

/// Single-use message key.
///
/// Zeroized on drop.
pub(crate) struct MessageKey {
    key: [u8; 32],
    message_number: u32,
}

impl MessageKey {
    /// Rebuild a stored skipped key.
    pub(crate) fn from_stored(key: [u8; 32], message_number: u32) -> Self {
        Self { key, message_number }
    }

    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub(crate) fn message_number(&self) -> u32 {
        self.message_number
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derive the message key for `message_number` and step the chain key in
/// place. The previous chain key is overwritten.
pub(crate) fn step_chain(chain_key: &mut [u8; 32], message_number: u32) -> MessageKey {
    let key = hmac_label(chain_key, MESSAGE_KEY_TAG);
    let mut next = hmac_label(chain_key, CHAIN_KEY_TAG);

    chain_key.zeroize();
    chain_key.copy_from_slice(&next);
    next.zeroize();

    MessageKey { key, message_number }
}

/// Mix a Diffie-Hellman output into the root key.
///
/// Overwrites `root_key` with the new root key and returns the new chain key.
pub(crate) fn step_root(root_key: &mut [u8; 32], dh_output: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_slice()), dh_output);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_KDF_INFO, &mut okm) else {
        unreachable!("HKDF-SHA256 can expand 64 bytes");
    };

    let mut chain_key = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();

    chain_key
}

fn hmac_label(chain_key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(chain_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}
