//! Palisade Cryptographic Primitives
//!
//! Key material, the X3DH handshake, the Double Ratchet and passphrase
//! protected key backups. Functions are pure apart from the random number
//! generator, which callers supply so tests stay deterministic.
//!
//! # Key Lifecycle
//!
//! A pairwise session starts from published key material and ends in
//! per-message keys that are used once and discarded.
//!
//! ```text
//! IdentityKeyPair + SignedPreKey + OneTimePreKey
//!        │
//!        ▼  KeyBundle (published, signature verified by the peer)
//! X3DH → SharedSecret
//!        │
//!        ▼
//! Double Ratchet root key
//!        │  DH ratchet step on every change of speaker
//!        ▼
//! Chain key → Message key → XChaCha20-Poly1305 → Ciphertext
//! ```
//!
//! Long-term keys leave the process only through [`backup::export_keys`],
//! encrypted under an Argon2id passphrase key.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are overwritten when the chain advances
//! - Message keys are zeroized after a single use
//! - One-time pre-keys are deleted once a handshake consumes them
//!
//! Post-Compromise Security:
//! - Each DH ratchet step mixes fresh Diffie-Hellman output into the root key
//!
//! Authenticity:
//! - Signed pre-keys are verified before any Diffie-Hellman operation
//! - Message headers are authenticated as AEAD associated data
//! - A failed tag check never advances ratchet state

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod backup;
pub mod error;
pub mod keys;
pub mod prekeys;
pub mod ratchet;
mod serde_hex;
pub mod x3dh;

pub use backup::{
    BACKUP_SALT_LEN, BACKUP_VERSION, BackupParams, KeyBackupPayload, MlsCredentialKeys, RESERVED_FIELDS,
    export_keys, import_keys,
};
pub use error::{BackupError, ErrorCategory, KeyError, RatchetError};
pub use keys::{
    DhKeyPair, IdentityKeyPair, KeyBundle, KeyType, OneTimePreKey, PublishedOneTimePreKey,
    PublishedSignedPreKey, SignedPreKey,
};
pub use prekeys::PreKeyStore;
pub use ratchet::{DoubleRatchet, MAX_SKIPPED_MESSAGE_KEYS, MessageHeader, ROOT_KDF_INFO, RatchetMessage};
pub use x3dh::{SharedSecret, X3DH_INFO, X3dhInitiation, X3dhOutput};
