//! Passphrase-protected key backups.
//!
//! # Format
//!
//! ```text
//! version (1) || salt (16) || nonce (24) || ciphertext (JSON payload + 16-byte tag)
//! ```
//!
//! The key is derived with Argon2id from the passphrase and salt. The
//! version byte and salt are authenticated as associated data, so a blob
//! cannot be re-labelled with different KDF inputs.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    aead::{self, KEY_LEN, NONCE_LEN, TAG_LEN},
    error::BackupError,
    keys::{IdentityKeyPair, OneTimePreKey, SignedPreKey},
};

/// Current backup format version.
pub const BACKUP_VERSION: u8 = 1;

/// Size of the random Argon2 salt.
pub const BACKUP_SALT_LEN: usize = 16;

const HEADER_LEN: usize = 1 + BACKUP_SALT_LEN;

/// Smallest blob that can possibly be valid.
pub const MIN_BACKUP_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Payload field names that `extra` may not use.
pub const RESERVED_FIELDS: [&str; 4] =
    ["identity_key", "signed_pre_key", "one_time_pre_keys", "mls_credential"];

/// Argon2id cost parameters bound to a backup format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl BackupParams {
    /// Parameters for `version`, or `None` if the version is unknown.
    pub fn for_version(version: u8) -> Option<Self> {
        match version {
            // Interactive cost class: 64 MiB, 2 passes
            1 => Some(Self { memory_kib: 64 * 1024, iterations: 2, parallelism: 1 }),
            _ => None,
        }
    }

    fn derive_key(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, BackupError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| BackupError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(passphrase, salt, &mut *key)
            .map_err(|e| BackupError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }
}

/// MLS signing credential as stored in a backup.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MlsCredentialKeys {
    /// Credential identity bytes
    #[serde(with = "hex::serde")]
    pub identity: Vec<u8>,
    /// Ed25519 signature public key
    #[serde(with = "crate::serde_hex")]
    pub signature_public_key: [u8; 32],
    /// Ed25519 signature private seed
    #[serde(with = "crate::serde_hex")]
    pub signature_private_key: [u8; 32],
}

impl PartialEq for MlsCredentialKeys {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.signature_public_key == other.signature_public_key
            && bool::from(self.signature_private_key.ct_eq(&other.signature_private_key))
    }
}

impl Eq for MlsCredentialKeys {}

impl fmt::Debug for MlsCredentialKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlsCredentialKeys")
            .field("identity", &hex::encode(&self.identity))
            .field("signature_public_key", &hex::encode(self.signature_public_key))
            .field("signature_private_key", &"[REDACTED]")
            .finish()
    }
}

/// Key material carried by a backup.
///
/// Known fields are typed. Anything else in the JSON object lands in
/// `extra` and is written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupPayload {
    /// Long-term identity key pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<IdentityKeyPair>,
    /// Current signed pre-key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKey>,
    /// Unused one-time pre-keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_time_pre_keys: Vec<OneTimePreKey>,
    /// MLS signing credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mls_credential: Option<MlsCredentialKeys>,
    /// Application-defined fields preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Encrypt `payload` under `passphrase`.
///
/// Fails with [`BackupError::ReservedField`] if an `extra` key shadows a
/// typed field; such a blob could never be imported.
pub fn export_keys<R: RngCore + CryptoRng>(
    payload: &KeyBackupPayload,
    passphrase: &str,
    rng: &mut R,
) -> Result<Vec<u8>, BackupError> {
    if let Some(field) = RESERVED_FIELDS.iter().find(|f| payload.extra.contains_key(**f)) {
        return Err(BackupError::ReservedField((*field).to_string()));
    }

    let plaintext = Zeroizing::new(
        serde_json::to_vec(payload).map_err(|e| BackupError::Serialization(e.to_string()))?,
    );

    let mut header = [0u8; HEADER_LEN];
    header[0] = BACKUP_VERSION;
    rng.fill_bytes(&mut header[1..]);
    let nonce = aead::random_nonce(rng);

    let Some(params) = BackupParams::for_version(BACKUP_VERSION) else {
        unreachable!("current backup version has parameters");
    };
    let key = params.derive_key(passphrase.as_bytes(), &header[1..])?;
    let ciphertext = aead::seal(&key, &nonce, &plaintext, &header);

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    tracing::debug!(bytes = out.len(), "exported key backup");
    Ok(out)
}

/// Decrypt a blob produced by [`export_keys`].
pub fn import_keys(bytes: &[u8], passphrase: &str) -> Result<KeyBackupPayload, BackupError> {
    if bytes.len() < MIN_BACKUP_LEN {
        return Err(BackupError::TooShort { actual: bytes.len(), minimum: MIN_BACKUP_LEN });
    }

    let version = bytes[0];
    let Some(params) = BackupParams::for_version(version) else {
        return Err(BackupError::UnsupportedVersion(version));
    };

    let header = &bytes[..HEADER_LEN];
    let salt = &bytes[1..HEADER_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN]);
    let ciphertext = &bytes[HEADER_LEN + NONCE_LEN..];

    let key = params.derive_key(passphrase.as_bytes(), salt)?;
    let plaintext = Zeroizing::new(
        aead::open(&key, &nonce, ciphertext, header).map_err(|_| BackupError::AuthenticationFailed)?,
    );

    let payload = serde_json::from_slice(&plaintext).map_err(|e| BackupError::Serialization(e.to_string()))?;
    tracing::debug!(version, "imported key backup");
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_payload_serializes_to_empty_object() {
        let json = serde_json::to_value(KeyBackupPayload::default()).unwrap();
        assert_eq!(json, json!({}));
    }

    #[test]
    fn unknown_fields_are_kept_in_extra() {
        let payload: KeyBackupPayload =
            serde_json::from_value(json!({ "device_name": "laptop", "flags": [1, 2] })).unwrap();
        assert_eq!(payload.extra.get("device_name"), Some(&json!("laptop")));
        assert_eq!(serde_json::to_value(&payload).unwrap(), json!({ "device_name": "laptop", "flags": [1, 2] }));
    }

    #[test]
    fn short_and_unversioned_blobs_fail_before_key_derivation() {
        assert_eq!(
            import_keys(&[BACKUP_VERSION; 10], "pw"),
            Err(BackupError::TooShort { actual: 10, minimum: MIN_BACKUP_LEN })
        );

        let mut blob = vec![0u8; MIN_BACKUP_LEN];
        blob[0] = 2;
        assert_eq!(import_keys(&blob, "pw"), Err(BackupError::UnsupportedVersion(2)));
    }

    #[test]
    fn export_layout() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let blob = export_keys(&KeyBackupPayload::default(), "pw", &mut rng).unwrap();

        assert_eq!(blob[0], BACKUP_VERSION);
        // "{}" plus tag
        assert_eq!(blob.len(), MIN_BACKUP_LEN + 2);
    }

    #[test]
    fn mls_credential_debug_is_redacted() {
        let keys = MlsCredentialKeys {
            identity: b"alice".to_vec(),
            signature_public_key: [1u8; 32],
            signature_private_key: [2u8; 32],
        };
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains(&hex::encode([2u8; 32])));
    }
}
