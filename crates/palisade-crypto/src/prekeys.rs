//! Local pre-key store.
//!
//! Owns the identity key, the signed pre-keys (current plus superseded ones
//! still accepted for in-flight handshakes) and the pool of unused one-time
//! pre-keys. One-time pre-keys are removed as soon as a handshake consumes
//! them.

use std::collections::BTreeMap;

use rand::{CryptoRng, RngCore};

use crate::{
    backup::KeyBackupPayload,
    error::KeyError,
    keys::{IdentityKeyPair, KeyBundle, OneTimePreKey, SignedPreKey, generate_one_time_pre_keys},
    x3dh::{self, SharedSecret, X3dhInitiation},
};

/// Holds a user's private pre-key material.
#[derive(Debug)]
pub struct PreKeyStore {
    identity: IdentityKeyPair,
    signed_pre_keys: BTreeMap<u32, SignedPreKey>,
    current_signed_pre_key_id: u32,
    one_time_pre_keys: BTreeMap<u32, OneTimePreKey>,
    next_signed_pre_key_id: u32,
    next_one_time_pre_key_id: u32,
}

impl PreKeyStore {
    /// Create a store with a first signed pre-key (id 1) and no one-time
    /// pre-keys. `now_ms` is milliseconds since the Unix epoch.
    pub fn new<R: RngCore + CryptoRng>(identity: IdentityKeyPair, now_ms: u64, rng: &mut R) -> Self {
        let signed_pre_key = SignedPreKey::generate(&identity, 1, now_ms, rng);
        let mut signed_pre_keys = BTreeMap::new();
        signed_pre_keys.insert(1, signed_pre_key);

        Self {
            identity,
            signed_pre_keys,
            current_signed_pre_key_id: 1,
            one_time_pre_keys: BTreeMap::new(),
            next_signed_pre_key_id: 2,
            next_one_time_pre_key_id: 1,
        }
    }

    /// Identity key pair.
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Signed pre-key currently published.
    pub fn current_signed_pre_key(&self) -> &SignedPreKey {
        let Some(key) = self.signed_pre_keys.get(&self.current_signed_pre_key_id) else {
            unreachable!("current signed pre-key is never pruned");
        };
        key
    }

    /// Look up a signed pre-key, current or superseded.
    pub fn signed_pre_key(&self, key_id: u32) -> Option<&SignedPreKey> {
        self.signed_pre_keys.get(&key_id)
    }

    /// Number of signed pre-keys held, current included.
    pub fn signed_pre_key_count(&self) -> usize {
        self.signed_pre_keys.len()
    }

    /// Generate a new signed pre-key and make it current.
    ///
    /// The previous key is kept until [`Self::prune_signed_pre_keys`] drops
    /// it, so handshakes started against it still complete.
    pub fn rotate_signed_pre_key<R: RngCore + CryptoRng>(&mut self, now_ms: u64, rng: &mut R) -> &SignedPreKey {
        let key_id = self.next_signed_pre_key_id;
        self.next_signed_pre_key_id = self.next_signed_pre_key_id.wrapping_add(1);
        self.current_signed_pre_key_id = key_id;

        tracing::info!(key_id, "rotated signed pre-key");
        self.signed_pre_keys
            .entry(key_id)
            .or_insert_with(|| SignedPreKey::generate(&self.identity, key_id, now_ms, rng))
    }

    /// Drop superseded signed pre-keys created more than `max_age_ms` ago.
    ///
    /// Returns the number of keys removed. The current key is always kept.
    pub fn prune_signed_pre_keys(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let current = self.current_signed_pre_key_id;
        let before = self.signed_pre_keys.len();
        self.signed_pre_keys.retain(|&key_id, key| {
            key_id == current || now_ms.saturating_sub(key.created_at()) <= max_age_ms
        });

        let removed = before - self.signed_pre_keys.len();
        if removed > 0 {
            tracing::debug!(removed, "pruned superseded signed pre-keys");
        }
        removed
    }

    /// Generate `count` new one-time pre-keys. Returns their ids.
    pub fn replenish_one_time_pre_keys<R: RngCore + CryptoRng>(&mut self, count: u32, rng: &mut R) -> Vec<u32> {
        let keys = generate_one_time_pre_keys(self.next_one_time_pre_key_id, count, rng);
        self.next_one_time_pre_key_id = self.next_one_time_pre_key_id.wrapping_add(count);

        keys.into_iter()
            .map(|key| {
                let key_id = key.key_id();
                self.one_time_pre_keys.insert(key_id, key);
                key_id
            })
            .collect()
    }

    /// Number of unused one-time pre-keys.
    pub fn one_time_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }

    /// Look up an unused one-time pre-key.
    pub fn one_time_pre_key(&self, key_id: u32) -> Option<&OneTimePreKey> {
        self.one_time_pre_keys.get(&key_id)
    }

    /// Remove and return a one-time pre-key.
    pub fn take_one_time_pre_key(&mut self, key_id: u32) -> Option<OneTimePreKey> {
        self.one_time_pre_keys.remove(&key_id)
    }

    /// Bundle with the current signed pre-key and the lowest-id unused
    /// one-time pre-key, if any remain.
    pub fn bundle(&self) -> KeyBundle {
        let one_time = self.one_time_pre_keys.values().next();
        KeyBundle::new(&self.identity, self.current_signed_pre_key(), one_time)
    }

    /// Public bundles for every unused one-time pre-key, for upload to a
    /// directory service.
    pub fn bundles(&self) -> Vec<KeyBundle> {
        let signed_pre_key = self.current_signed_pre_key();
        self.one_time_pre_keys
            .values()
            .map(|key| KeyBundle::new(&self.identity, signed_pre_key, Some(key)))
            .collect()
    }

    /// Complete X3DH for an incoming initiation.
    ///
    /// The referenced one-time pre-key is deleted once agreement succeeds. A
    /// referenced key that is no longer held fails with
    /// [`KeyError::UnknownPreKey`], which makes a replayed initiation fail.
    pub fn respond(&mut self, initiation: &X3dhInitiation) -> Result<SharedSecret, KeyError> {
        let signed_pre_key = self.signed_pre_keys.get(&initiation.signed_pre_key_id).ok_or(
            KeyError::UnknownPreKey { what: "signed pre-key", id: initiation.signed_pre_key_id },
        )?;

        let one_time_pre_key = initiation
            .one_time_pre_key_id
            .map(|id| {
                self.one_time_pre_keys
                    .get(&id)
                    .ok_or(KeyError::UnknownPreKey { what: "one-time pre-key", id })
            })
            .transpose()?;

        let secret = x3dh::respond(
            &self.identity,
            signed_pre_key.key_pair().private_key(),
            one_time_pre_key.map(|key| key.key_pair().private_key().as_slice()),
            &initiation.identity_key,
            &initiation.ephemeral_key,
        )?;

        if let Some(id) = initiation.one_time_pre_key_id {
            self.one_time_pre_keys.remove(&id);
            tracing::debug!(key_id = id, remaining = self.one_time_pre_keys.len(), "consumed one-time pre-key");
        }

        Ok(secret)
    }

    /// Key material for [`crate::backup::export_keys`].
    pub fn to_backup_payload(&self) -> KeyBackupPayload {
        KeyBackupPayload {
            identity_key: Some(self.identity.clone()),
            signed_pre_key: Some(self.current_signed_pre_key().clone()),
            one_time_pre_keys: self.one_time_pre_keys.values().cloned().collect(),
            ..KeyBackupPayload::default()
        }
    }

    /// Rebuild a store from an imported backup.
    ///
    /// Superseded signed pre-keys are not part of a backup and are lost.
    pub fn from_backup_payload(payload: &KeyBackupPayload) -> Result<Self, KeyError> {
        let identity = payload
            .identity_key
            .clone()
            .ok_or(KeyError::MissingKey { what: "identity key" })?;
        let signed_pre_key = payload
            .signed_pre_key
            .clone()
            .ok_or(KeyError::MissingKey { what: "signed pre-key" })?;
        signed_pre_key.verify(identity.public_key())?;

        let current_signed_pre_key_id = signed_pre_key.key_id();
        let mut signed_pre_keys = BTreeMap::new();
        signed_pre_keys.insert(current_signed_pre_key_id, signed_pre_key);

        let one_time_pre_keys: BTreeMap<u32, OneTimePreKey> =
            payload.one_time_pre_keys.iter().map(|key| (key.key_id(), key.clone())).collect();
        let next_one_time_pre_key_id =
            one_time_pre_keys.keys().next_back().map_or(1, |id| id.wrapping_add(1));

        Ok(Self {
            identity,
            signed_pre_keys,
            current_signed_pre_key_id,
            one_time_pre_keys,
            next_signed_pre_key_id: current_signed_pre_key_id.wrapping_add(1),
            next_one_time_pre_key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn store(rng: &mut ChaCha20Rng) -> PreKeyStore {
        PreKeyStore::new(IdentityKeyPair::generate(rng), 0, rng)
    }

    #[test]
    fn new_store_has_verified_signed_pre_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let store = store(&mut rng);

        assert_eq!(store.current_signed_pre_key().key_id(), 1);
        assert!(store.bundle().verify().is_ok());
        assert!(store.bundle().one_time_pre_key.is_none());
    }

    #[test]
    fn replenish_assigns_fresh_ids() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let mut store = store(&mut rng);

        assert_eq!(store.replenish_one_time_pre_keys(3, &mut rng), vec![1, 2, 3]);
        assert_eq!(store.replenish_one_time_pre_keys(2, &mut rng), vec![4, 5]);
        assert_eq!(store.one_time_pre_key_count(), 5);
        assert_eq!(store.bundles().len(), 5);
    }

    #[test]
    fn rotation_keeps_old_key_until_pruned() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut store = store(&mut rng);

        let rotated = store.rotate_signed_pre_key(DAY_MS, &mut rng).key_id();
        assert_eq!(rotated, 2);
        assert!(store.signed_pre_key(1).is_some());

        assert_eq!(store.prune_signed_pre_keys(DAY_MS, 7 * DAY_MS), 0);
        assert_eq!(store.prune_signed_pre_keys(30 * DAY_MS, 7 * DAY_MS), 1);
        assert!(store.signed_pre_key(1).is_none());
        assert_eq!(store.current_signed_pre_key().key_id(), 2);
    }

    #[test]
    fn respond_consumes_one_time_pre_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let mut bob = store(&mut rng);
        bob.replenish_one_time_pre_keys(2, &mut rng);
        let alice = IdentityKeyPair::generate(&mut rng);

        let output = x3dh::initiate(&alice, &bob.bundle(), &mut rng).unwrap();
        let secret = bob.respond(&output.initiation).unwrap();

        assert_eq!(secret, output.shared_secret);
        assert_eq!(bob.one_time_pre_key_count(), 1);

        let replay = bob.respond(&output.initiation);
        assert_eq!(replay, Err(KeyError::UnknownPreKey { what: "one-time pre-key", id: 1 }));
    }

    #[test]
    fn respond_accepts_superseded_signed_pre_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut bob = store(&mut rng);
        let alice = IdentityKeyPair::generate(&mut rng);

        let old_bundle = bob.bundle();
        bob.rotate_signed_pre_key(1, &mut rng);

        let output = x3dh::initiate(&alice, &old_bundle, &mut rng).unwrap();
        assert_eq!(bob.respond(&output.initiation).unwrap(), output.shared_secret);
    }

    #[test]
    fn backup_payload_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let mut original = store(&mut rng);
        original.replenish_one_time_pre_keys(4, &mut rng);

        let restored = PreKeyStore::from_backup_payload(&original.to_backup_payload()).unwrap();
        assert_eq!(restored.identity(), original.identity());
        assert_eq!(restored.bundle(), original.bundle());

        let mut restored = restored;
        assert_eq!(restored.replenish_one_time_pre_keys(1, &mut rng), vec![5]);
    }
}
