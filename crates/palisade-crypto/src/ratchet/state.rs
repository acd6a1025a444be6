//! Double Ratchet state machine and its persisted form.

use std::collections::HashMap;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{
    MAX_SKIPPED_MESSAGE_KEYS,
    chain::{MessageKey, step_chain, step_root},
    header::MessageHeader,
};
use crate::{
    aead::{self, NONCE_LEN},
    error::RatchetError,
    keys::{DhKeyPair, PUBLIC_KEY_LEN},
};

/// Version tag of the serialized state layout.
const STATE_VERSION: u8 = 1;

/// Identifies a skipped message key: the sender ratchet key plus the message
/// number within that chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SkippedKeyId {
    pub(crate) dh_public_key: [u8; PUBLIC_KEY_LEN],
    pub(crate) message_number: u32,
}

/// Mutable ratchet state. Cloned before every decryption so a failed
/// decryption leaves the committed state untouched.
#[derive(Clone)]
pub(crate) struct RatchetState {
    pub(crate) dh_self: DhKeyPair,
    pub(crate) dh_remote: Option<[u8; PUBLIC_KEY_LEN]>,
    pub(crate) root_key: [u8; 32],
    pub(crate) sending_chain: Option<[u8; 32]>,
    pub(crate) receiving_chain: Option<[u8; 32]>,
    pub(crate) send_count: u32,
    pub(crate) receive_count: u32,
    pub(crate) previous_chain_length: u32,
    pub(crate) skipped: HashMap<SkippedKeyId, [u8; 32]>,
}

impl RatchetState {
    /// Derive the next sending message key and build its header.
    pub(crate) fn next_sending_key(&mut self) -> Result<(MessageHeader, MessageKey), RatchetError> {
        let Some(chain) = self.sending_chain.as_mut() else {
            return Err(RatchetError::NotReady { chain: "sending" });
        };
        if self.send_count == u32::MAX {
            return Err(RatchetError::CounterOverflow { current: self.send_count });
        }

        let header = MessageHeader {
            dh_public_key: *self.dh_self.public_key(),
            previous_chain_length: self.previous_chain_length,
            message_number: self.send_count,
        };
        let message_key = step_chain(chain, self.send_count);
        self.send_count += 1;

        Ok((header, message_key))
    }

    /// Decrypt one message, mutating `self`. Callers run this on a clone and
    /// commit only on success.
    pub(crate) fn decrypt<R: RngCore + CryptoRng>(
        &mut self,
        header: &MessageHeader,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, RatchetError> {
        let id = SkippedKeyId {
            dh_public_key: header.dh_public_key,
            message_number: header.message_number,
        };
        if let Some(stored) = self.skipped.remove(&id) {
            let message_key = MessageKey::from_stored(stored, header.message_number);
            tracing::trace!(message_number = header.message_number, "using skipped message key");
            return open(&message_key, header, nonce, ciphertext);
        }

        if self.dh_remote != Some(header.dh_public_key) {
            self.skip_message_keys(header.previous_chain_length)?;
            self.dh_ratchet(&header.dh_public_key, rng)?;
        }

        if header.message_number < self.receive_count {
            return Err(RatchetError::MessageKeyUnavailable { message_number: header.message_number });
        }
        if header.message_number == u32::MAX {
            return Err(RatchetError::CounterOverflow { current: header.message_number });
        }

        self.skip_message_keys(header.message_number)?;

        let Some(chain) = self.receiving_chain.as_mut() else {
            return Err(RatchetError::NotReady { chain: "receiving" });
        };
        let message_key = step_chain(chain, self.receive_count);
        self.receive_count += 1;

        open(&message_key, header, nonce, ciphertext)
    }

    /// Store message keys for the current receiving chain up to (excluding)
    /// `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        let Some(chain) = self.receiving_chain.as_mut() else {
            return Ok(());
        };
        let Some(dh_remote) = self.dh_remote else {
            return Ok(());
        };
        if until <= self.receive_count {
            return Ok(());
        }

        let requested = (until - self.receive_count) as usize;
        if self.skipped.len() + requested > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(RatchetError::SkippedKeyOverflow {
                stored: self.skipped.len(),
                requested,
                limit: MAX_SKIPPED_MESSAGE_KEYS,
            });
        }

        while self.receive_count < until {
            let message_key = step_chain(chain, self.receive_count);
            self.skipped.insert(
                SkippedKeyId { dh_public_key: dh_remote, message_number: self.receive_count },
                *message_key.key(),
            );
            self.receive_count += 1;
        }

        tracing::debug!(requested, stored = self.skipped.len(), "stored skipped message keys");
        Ok(())
    }

    /// Advance the root chain twice on a new peer ratchet key.
    fn dh_ratchet<R: RngCore + CryptoRng>(
        &mut self,
        dh_remote: &[u8; PUBLIC_KEY_LEN],
        rng: &mut R,
    ) -> Result<(), RatchetError> {
        self.previous_chain_length = self.send_count;
        self.send_count = 0;
        self.receive_count = 0;
        self.dh_remote = Some(*dh_remote);

        let receive_secret = self.dh_self.diffie_hellman(dh_remote, "peer ratchet key")?;
        self.receiving_chain = Some(step_root(&mut self.root_key, &receive_secret));

        self.dh_self = DhKeyPair::generate(rng);
        let send_secret = self.dh_self.diffie_hellman(dh_remote, "peer ratchet key")?;
        self.sending_chain = Some(step_root(&mut self.root_key, &send_secret));

        tracing::debug!(previous_chain_length = self.previous_chain_length, "ratchet step");
        Ok(())
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, RatchetError> {
        let mut skipped: Vec<SkippedKeyRecord> = self
            .skipped
            .iter()
            .map(|(id, key)| SkippedKeyRecord {
                dh_public_key: id.dh_public_key,
                message_number: id.message_number,
                message_key: *key,
            })
            .collect();
        skipped.sort_by(|a, b| {
            (a.dh_public_key, a.message_number).cmp(&(b.dh_public_key, b.message_number))
        });

        let snapshot = StateSnapshot {
            version: STATE_VERSION,
            dh_private_key: *self.dh_self.private_key(),
            dh_remote: self.dh_remote,
            root_key: self.root_key,
            sending_chain: self.sending_chain,
            receiving_chain: self.receiving_chain,
            send_count: self.send_count,
            receive_count: self.receive_count,
            previous_chain_length: self.previous_chain_length,
            skipped,
        };

        let mut out = Vec::new();
        let result = ciborium::into_writer(&snapshot, &mut out)
            .map_err(|e| RatchetError::Serialization(e.to_string()));
        drop(snapshot);
        result.map(|()| out)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        let snapshot: StateSnapshot =
            ciborium::from_reader(bytes).map_err(|e| RatchetError::Serialization(e.to_string()))?;

        if snapshot.version != STATE_VERSION {
            return Err(RatchetError::Serialization(format!(
                "unsupported state version {}",
                snapshot.version
            )));
        }
        if snapshot.skipped.len() > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(RatchetError::SkippedKeyOverflow {
                stored: snapshot.skipped.len(),
                requested: 0,
                limit: MAX_SKIPPED_MESSAGE_KEYS,
            });
        }
        if snapshot.dh_remote.is_none() && snapshot.receiving_chain.is_some() {
            return Err(RatchetError::Serialization(
                "receiving chain without peer ratchet key".to_string(),
            ));
        }

        let skipped = snapshot
            .skipped
            .iter()
            .map(|record| {
                (
                    SkippedKeyId {
                        dh_public_key: record.dh_public_key,
                        message_number: record.message_number,
                    },
                    record.message_key,
                )
            })
            .collect();

        Ok(Self {
            dh_self: DhKeyPair::from_private(snapshot.dh_private_key),
            dh_remote: snapshot.dh_remote,
            root_key: snapshot.root_key,
            sending_chain: snapshot.sending_chain,
            receiving_chain: snapshot.receiving_chain,
            send_count: snapshot.send_count,
            receive_count: snapshot.receive_count,
            previous_chain_length: snapshot.previous_chain_length,
            skipped,
        })
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(chain) = self.sending_chain.as_mut() {
            chain.zeroize();
        }
        if let Some(chain) = self.receiving_chain.as_mut() {
            chain.zeroize();
        }
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

fn open(
    message_key: &MessageKey,
    header: &MessageHeader,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    aead::open(message_key.key(), nonce, ciphertext, &header.encode()).map_err(|_| {
        RatchetError::DecryptionFailed {
            reason: format!("authentication failed for message {}", message_key.message_number()),
        }
    })
}

#[derive(Serialize, Deserialize)]
struct SkippedKeyRecord {
    dh_public_key: [u8; PUBLIC_KEY_LEN],
    message_number: u32,
    message_key: [u8; 32],
}

impl Drop for SkippedKeyRecord {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    version: u8,
    dh_private_key: [u8; 32],
    dh_remote: Option<[u8; PUBLIC_KEY_LEN]>,
    root_key: [u8; 32],
    sending_chain: Option<[u8; 32]>,
    receiving_chain: Option<[u8; 32]>,
    send_count: u32,
    receive_count: u32,
    previous_chain_length: u32,
    skipped: Vec<SkippedKeyRecord>,
}

impl Drop for StateSnapshot {
    fn drop(&mut self) {
        self.dh_private_key.zeroize();
        self.root_key.zeroize();
        if let Some(chain) = self.sending_chain.as_mut() {
            chain.zeroize();
        }
        if let Some(chain) = self.receiving_chain.as_mut() {
            chain.zeroize();
        }
    }
}
