//! Double Ratchet for one-to-one sessions.
//!
//! Seeded by an X3DH [`SharedSecret`]. Every message advances a symmetric
//! chain (forward secrecy), and every change of speaker performs a
//! Diffie-Hellman ratchet step that re-keys the root chain (post-compromise
//! security).
//!
//! ```text
//!            root key
//!               │  DH(own ratchet key, peer ratchet key)
//!               ▼
//!   HKDF ──► new root key + chain key
//!                              │
//!                              ▼
//!               HMAC ──► message key (single use)
//!                    └─► next chain key
//! ```
//!
//! Out-of-order messages are handled by storing skipped message keys, up to
//! [`MAX_SKIPPED_MESSAGE_KEYS`] in total. Decryption is transactional: when
//! it fails for any reason the ratchet state is exactly what it was before
//! the call.

mod chain;
mod header;
mod state;

use std::collections::HashMap;

pub use header::{HEADER_LEN, MessageHeader, RatchetMessage};
use rand::{CryptoRng, RngCore};
use state::RatchetState;

use crate::{
    aead::{self, NONCE_LEN},
    error::RatchetError,
    keys::{DhKeyPair, PUBLIC_KEY_LEN, fixed},
    x3dh::SharedSecret,
};

/// Upper bound on stored skipped message keys per session.
pub const MAX_SKIPPED_MESSAGE_KEYS: usize = 1000;

/// HKDF info string for root key derivation.
pub const ROOT_KDF_INFO: &[u8] = b"PalisadeRatchetRoot";

/// Per-peer Double Ratchet session.
pub struct DoubleRatchet {
    state: RatchetState,
}

impl DoubleRatchet {
    /// Initialize the side that ran X3DH as initiator.
    ///
    /// Performs the first DH ratchet step against the responder's signed
    /// pre-key, so the initiator can send immediately.
    pub fn init_as_initiator<R: RngCore + CryptoRng>(
        shared_secret: &SharedSecret,
        peer_signed_pre_key: &[u8],
        rng: &mut R,
    ) -> Result<Self, RatchetError> {
        let peer: [u8; PUBLIC_KEY_LEN] = fixed(peer_signed_pre_key, "peer signed pre-key")?;
        let dh_self = DhKeyPair::generate(rng);
        let dh_output = dh_self.diffie_hellman(&peer, "peer signed pre-key")?;

        let mut root_key = *shared_secret.as_bytes();
        let sending_chain = chain::step_root(&mut root_key, &dh_output);

        Ok(Self {
            state: RatchetState {
                dh_self,
                dh_remote: Some(peer),
                root_key,
                sending_chain: Some(sending_chain),
                receiving_chain: None,
                send_count: 0,
                receive_count: 0,
                previous_chain_length: 0,
                skipped: HashMap::new(),
            },
        })
    }

    /// Initialize the side that ran X3DH as responder.
    ///
    /// The responder's ratchet key is its signed pre-key. It cannot send
    /// until the initiator's first message arrives.
    pub fn init_as_responder(shared_secret: &SharedSecret, own_signed_pre_key: &DhKeyPair) -> Self {
        Self {
            state: RatchetState {
                dh_self: own_signed_pre_key.clone(),
                dh_remote: None,
                root_key: *shared_secret.as_bytes(),
                sending_chain: None,
                receiving_chain: None,
                send_count: 0,
                receive_count: 0,
                previous_chain_length: 0,
                skipped: HashMap::new(),
            },
        }
    }

    /// Encrypt `plaintext` under the next sending message key.
    ///
    /// The header is authenticated as associated data.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &mut self,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<RatchetMessage, RatchetError> {
        let (header, message_key) = self.state.next_sending_key()?;
        let nonce = aead::random_nonce(rng);
        let ciphertext = aead::seal(message_key.key(), &nonce, plaintext, &header.encode());

        Ok(RatchetMessage { header, nonce, ciphertext })
    }

    /// Decrypt a message received from the peer.
    ///
    /// On any error the ratchet state is left unchanged.
    pub fn decrypt<R: RngCore + CryptoRng>(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        rng: &mut R,
    ) -> Result<Vec<u8>, RatchetError> {
        let mut next = self.state.clone();
        match next.decrypt(header, nonce, ciphertext, rng) {
            Ok(plaintext) => {
                self.state = next;
                Ok(plaintext)
            },
            Err(err) => {
                tracing::warn!(
                    message_number = header.message_number,
                    error = %err,
                    "ratchet decryption failed, state unchanged"
                );
                Err(err)
            },
        }
    }

    /// Decrypt a parsed [`RatchetMessage`].
    pub fn decrypt_message<R: RngCore + CryptoRng>(
        &mut self,
        message: &RatchetMessage,
        rng: &mut R,
    ) -> Result<Vec<u8>, RatchetError> {
        self.decrypt(&message.header, &message.ciphertext, &message.nonce, rng)
    }

    /// Serialize the full state, private keys included.
    ///
    /// The output is secret and must be stored encrypted at rest.
    pub fn serialize(&self) -> Result<Vec<u8>, RatchetError> {
        self.state.to_bytes()
    }

    /// Restore a ratchet from [`Self::serialize`] output.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, RatchetError> {
        Ok(Self { state: RatchetState::from_bytes(bytes)? })
    }

    /// Own current ratchet public key.
    pub fn ratchet_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.state.dh_self.public_key()
    }

    /// Peer's current ratchet public key, if one has been seen.
    pub fn peer_ratchet_public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.state.dh_remote.as_ref()
    }

    /// True once a sending chain exists.
    pub fn can_send(&self) -> bool {
        self.state.sending_chain.is_some()
    }

    /// Messages sent in the current sending chain.
    pub fn send_count(&self) -> u32 {
        self.state.send_count
    }

    /// Messages received in the current receiving chain.
    pub fn receive_count(&self) -> u32 {
        self.state.receive_count
    }

    /// Length of the previous sending chain.
    pub fn previous_chain_length(&self) -> u32 {
        self.state.previous_chain_length
    }

    /// Number of stored skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.state.skipped.len()
    }
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("ratchet_public_key", &hex::encode(self.ratchet_public_key()))
            .field("send_count", &self.state.send_count)
            .field("receive_count", &self.state.receive_count)
            .field("previous_chain_length", &self.state.previous_chain_length)
            .field("skipped", &self.state.skipped.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn pair(rng: &mut ChaCha20Rng) -> (DoubleRatchet, DoubleRatchet) {
        let secret = SharedSecret::from_bytes([42u8; 32]);
        let bob_spk = DhKeyPair::generate(rng);
        let alice = DoubleRatchet::init_as_initiator(&secret, bob_spk.public_key(), rng).unwrap();
        let bob = DoubleRatchet::init_as_responder(&secret, &bob_spk);
        (alice, bob)
    }

    #[test]
    fn responder_cannot_send_before_first_message() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (_, mut bob) = pair(&mut rng);

        assert!(!bob.can_send());
        let result = bob.encrypt(b"too early", &mut rng);
        assert_eq!(result.unwrap_err(), RatchetError::NotReady { chain: "sending" });
    }

    #[test]
    fn in_order_conversation() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let (mut alice, mut bob) = pair(&mut rng);

        let m = alice.encrypt(b"hi bob", &mut rng).unwrap();
        assert_eq!(bob.decrypt_message(&m, &mut rng).unwrap(), b"hi bob");
        assert!(bob.can_send());

        let reply = bob.encrypt(b"hi alice", &mut rng).unwrap();
        assert_eq!(alice.decrypt_message(&reply, &mut rng).unwrap(), b"hi alice");

        assert_eq!(alice.previous_chain_length(), 1);
        assert_eq!(alice.send_count(), 0);
    }

    #[test]
    fn out_of_order_within_chain() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (mut alice, mut bob) = pair(&mut rng);

        let m0 = alice.encrypt(b"zero", &mut rng).unwrap();
        let m1 = alice.encrypt(b"one", &mut rng).unwrap();
        let m2 = alice.encrypt(b"two", &mut rng).unwrap();

        assert_eq!(bob.decrypt_message(&m2, &mut rng).unwrap(), b"two");
        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt_message(&m0, &mut rng).unwrap(), b"zero");
        assert_eq!(bob.decrypt_message(&m1, &mut rng).unwrap(), b"one");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn skipped_keys_survive_a_ratchet_step() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let (mut alice, mut bob) = pair(&mut rng);

        let first = alice.encrypt(b"first", &mut rng).unwrap();
        let delayed = alice.encrypt(b"delayed", &mut rng).unwrap();
        bob.decrypt_message(&first, &mut rng).unwrap();

        let reply = bob.encrypt(b"reply", &mut rng).unwrap();
        alice.decrypt_message(&reply, &mut rng).unwrap();
        let next_chain = alice.encrypt(b"new chain", &mut rng).unwrap();

        // previous_chain_length tells bob to stash the delayed key first
        assert_eq!(bob.decrypt_message(&next_chain, &mut rng).unwrap(), b"new chain");
        assert_eq!(bob.skipped_key_count(), 1);
        assert_eq!(bob.decrypt_message(&delayed, &mut rng).unwrap(), b"delayed");
    }

    #[test]
    fn replay_is_rejected_without_state_change() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let (mut alice, mut bob) = pair(&mut rng);

        let m = alice.encrypt(b"once", &mut rng).unwrap();
        bob.decrypt_message(&m, &mut rng).unwrap();
        let before = bob.serialize().unwrap();

        let result = bob.decrypt_message(&m, &mut rng);
        assert_eq!(result.unwrap_err(), RatchetError::MessageKeyUnavailable { message_number: 0 });
        assert_eq!(bob.serialize().unwrap(), before);
    }

    #[test]
    fn tampered_ciphertext_leaves_state_unchanged() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let (mut alice, mut bob) = pair(&mut rng);

        let mut m = alice.encrypt(b"payload", &mut rng).unwrap();
        let original = m.ciphertext.clone();
        m.ciphertext[0] ^= 0xff;
        let before = bob.serialize().unwrap();

        let err = bob.decrypt_message(&m, &mut rng).unwrap_err();
        assert!(matches!(err, RatchetError::DecryptionFailed { .. }));
        assert!(!err.is_fatal());
        assert_eq!(bob.serialize().unwrap(), before);

        m.ciphertext = original;
        assert_eq!(bob.decrypt_message(&m, &mut rng).unwrap(), b"payload");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (mut alice, mut bob) = pair(&mut rng);

        let _m0 = alice.encrypt(b"zero", &mut rng).unwrap();
        let mut m1 = alice.encrypt(b"one", &mut rng).unwrap();
        m1.header.message_number = 0;

        let err = bob.decrypt_message(&m1, &mut rng).unwrap_err();
        assert!(matches!(err, RatchetError::DecryptionFailed { .. }));
    }

    #[test]
    fn skip_beyond_bound_overflows() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let (mut alice, mut bob) = pair(&mut rng);

        let m0 = alice.encrypt(b"zero", &mut rng).unwrap();
        bob.decrypt_message(&m0, &mut rng).unwrap();

        let mut far = alice.encrypt(b"far", &mut rng).unwrap();
        far.header.message_number = MAX_SKIPPED_MESSAGE_KEYS as u32 + 5;

        let err = bob.decrypt_message(&far, &mut rng).unwrap_err();
        assert!(matches!(err, RatchetError::SkippedKeyOverflow { limit: MAX_SKIPPED_MESSAGE_KEYS, .. }));
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn serialized_state_resumes_conversation() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let (mut alice, mut bob) = pair(&mut rng);

        let m0 = alice.encrypt(b"zero", &mut rng).unwrap();
        let m1 = alice.encrypt(b"one", &mut rng).unwrap();
        bob.decrypt_message(&m1, &mut rng).unwrap();

        let mut restored = DoubleRatchet::deserialize(&bob.serialize().unwrap()).unwrap();
        assert_eq!(restored.skipped_key_count(), 1);
        assert_eq!(restored.decrypt_message(&m0, &mut rng).unwrap(), b"zero");

        let reply = restored.encrypt(b"back", &mut rng).unwrap();
        assert_eq!(alice.decrypt_message(&reply, &mut rng).unwrap(), b"back");
    }

    #[test]
    fn fresh_responder_state_serializes() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let (_, bob) = pair(&mut rng);

        let restored = DoubleRatchet::deserialize(&bob.serialize().unwrap()).unwrap();
        assert!(!restored.can_send());
        assert_eq!(restored.ratchet_public_key(), bob.ratchet_public_key());
    }

    #[test]
    fn garbage_state_is_rejected() {
        let result = DoubleRatchet::deserialize(b"not a ratchet");
        assert!(matches!(result, Err(RatchetError::Serialization(_))));
    }
}
