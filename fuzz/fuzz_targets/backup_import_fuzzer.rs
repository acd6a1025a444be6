//! Fuzz target for encrypted key backup import
//!
//! # Strategy
//!
//! - Random bytes: arbitrary blobs of any length
//! - Valid header: correct version byte followed by arbitrary salt, nonce and
//!   ciphertext, which reaches the KDF and AEAD
//! - Truncation: a genuine backup cut at an arbitrary length
//!
//! # Invariants
//!
//! - Import never panics
//! - Blobs below the minimum length fail with `TooShort`
//! - A blob that is not a genuine backup never decrypts
//! - Every prefix of a genuine backup fails

#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use palisade_crypto::{
    BACKUP_VERSION, BackupError, KeyBackupPayload, backup::MIN_BACKUP_LEN, export_keys,
    import_keys,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const PASSPHRASE: &str = "fuzz";

#[derive(Debug, Clone, Arbitrary)]
enum BackupInput {
    RandomBytes { bytes: Vec<u8> },
    ValidHeader { body: Vec<u8> },
    Truncated { keep: u16 },
}

/// One genuine backup, encrypted once per process (Argon2id is expensive).
fn genuine() -> &'static [u8] {
    static BLOB: OnceLock<Vec<u8>> = OnceLock::new();
    BLOB.get_or_init(|| {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        export_keys(&KeyBackupPayload::default(), PASSPHRASE, &mut rng)
            .expect("empty payload always encrypts")
    })
}

fuzz_target!(|input: BackupInput| {
    match input {
        BackupInput::RandomBytes { bytes } => {
            let result = import_keys(&bytes, PASSPHRASE);
            if bytes.len() < MIN_BACKUP_LEN {
                assert!(matches!(result, Err(BackupError::TooShort { .. })));
            }
        },
        BackupInput::ValidHeader { body } => {
            let mut bytes = Vec::with_capacity(body.len() + 1);
            bytes.push(BACKUP_VERSION);
            bytes.extend_from_slice(&body);

            if bytes.as_slice() != genuine() {
                assert!(import_keys(&bytes, PASSPHRASE).is_err());
            }
        },
        BackupInput::Truncated { keep } => {
            let blob = genuine();
            let keep = usize::from(keep) % blob.len();
            assert!(import_keys(&blob[..keep], PASSPHRASE).is_err());
        },
    }
});
