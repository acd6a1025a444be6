//! Message header and wire layout.

use serde::{Deserialize, Serialize};

use crate::{
    aead::{NONCE_LEN, TAG_LEN},
    error::KeyError,
    keys::{PUBLIC_KEY_LEN, fixed},
};

/// Encoded header size: `dh_public_key || previous_chain_length || message_number`.
pub const HEADER_LEN: usize = PUBLIC_KEY_LEN + 4 + 4;

/// Per-message ratchet header.
///
/// Sent in the clear but authenticated as associated data of the message
/// ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    #[serde(with = "crate::serde_hex")]
    pub dh_public_key: [u8; PUBLIC_KEY_LEN],
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain
    pub message_number: u32,
}

impl MessageHeader {
    /// Big-endian encoding used as AEAD associated data.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(&self.dh_public_key);
        out[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + 4]
            .copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[PUBLIC_KEY_LEN + 4..].copy_from_slice(&self.message_number.to_be_bytes());
        out
    }

    /// Decode a header produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; HEADER_LEN] = fixed(bytes, "message header")?;

        let mut dh_public_key = [0u8; PUBLIC_KEY_LEN];
        dh_public_key.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        let mut pn = [0u8; 4];
        pn.copy_from_slice(&bytes[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + 4]);
        let mut n = [0u8; 4];
        n.copy_from_slice(&bytes[PUBLIC_KEY_LEN + 4..]);

        Ok(Self {
            dh_public_key,
            previous_chain_length: u32::from_be_bytes(pn),
            message_number: u32::from_be_bytes(n),
        })
    }
}

/// Encrypted ratchet message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Cleartext header
    pub header: MessageHeader,
    /// Random XChaCha20 nonce
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext including the Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Minimum encoded length (empty plaintext).
    pub const MIN_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

    /// Wire encoding: `header || nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(KeyError::InvalidKeyLength {
                what: "ratchet message",
                expected: Self::MIN_LEN,
                actual: bytes.len(),
            });
        }

        let header = MessageHeader::decode(&bytes[..HEADER_LEN])?;
        let nonce = fixed(&bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN], "message nonce")?;
        let ciphertext = bytes[HEADER_LEN + NONCE_LEN..].to_vec();

        Ok(Self { header, nonce, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encoding_is_big_endian() {
        let header = MessageHeader {
            dh_public_key: [9u8; 32],
            previous_chain_length: 1,
            message_number: 0x0102_0304,
        };
        let encoded = header.encode();

        assert_eq!(&encoded[32..36], &[0, 0, 0, 1]);
        assert_eq!(&encoded[36..40], &[1, 2, 3, 4]);
        assert_eq!(MessageHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn short_message_is_rejected() {
        let result = RatchetMessage::from_bytes(&[0u8; RatchetMessage::MIN_LEN - 1]);
        assert!(matches!(result, Err(KeyError::InvalidKeyLength { what: "ratchet message", .. })));
    }

    #[test]
    fn message_wire_layout() {
        let message = RatchetMessage {
            header: MessageHeader { dh_public_key: [1u8; 32], previous_chain_length: 2, message_number: 3 },
            nonce: [4u8; NONCE_LEN],
            ciphertext: vec![5u8; TAG_LEN + 3],
        };
        let bytes = message.to_bytes();

        assert_eq!(bytes.len(), HEADER_LEN + NONCE_LEN + TAG_LEN + 3);
        assert_eq!(RatchetMessage::from_bytes(&bytes).unwrap(), message);
    }
}
