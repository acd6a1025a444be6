//! Key backup export/import tests.
//!
//! Argon2id runs at full interactive cost, so these stay example-based
//! rather than property-based.

use palisade_crypto::{
    BACKUP_VERSION, BackupError, ErrorCategory, IdentityKeyPair, KeyBackupPayload, MlsCredentialKeys,
    PreKeyStore, RESERVED_FIELDS, export_keys, import_keys,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::json;

fn full_payload(rng: &mut ChaCha20Rng) -> KeyBackupPayload {
    let mut store = PreKeyStore::new(IdentityKeyPair::generate(rng), 1_700_000_000_000, rng);
    store.replenish_one_time_pre_keys(3, rng);

    let mut payload = store.to_backup_payload();
    payload.mls_credential = Some(MlsCredentialKeys {
        identity: b"alice@example".to_vec(),
        signature_public_key: [3u8; 32],
        signature_private_key: [4u8; 32],
    });
    payload.extra.insert("device".to_string(), json!({ "name": "laptop", "paired": [1, 2, 3] }));
    payload
}

#[test]
fn roundtrip_preserves_every_field() {
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let payload = full_payload(&mut rng);

    let blob = export_keys(&payload, "correct horse", &mut rng).unwrap();
    let restored = import_keys(&blob, "correct horse").unwrap();

    assert_eq!(restored, payload);
    assert_eq!(serde_json::to_value(&restored).unwrap(), serde_json::to_value(&payload).unwrap());

    let store = PreKeyStore::from_backup_payload(&restored).unwrap();
    assert_eq!(store.one_time_pre_key_count(), 3);
}

#[test]
fn wrong_passphrase_is_an_authentication_failure() {
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let blob = export_keys(&full_payload(&mut rng), "right", &mut rng).unwrap();

    let err = import_keys(&blob, "wrong").unwrap_err();
    assert_eq!(err, BackupError::AuthenticationFailed);
    assert_eq!(err.category(), ErrorCategory::Authentication);
}

#[test]
fn tampering_anywhere_is_detected() {
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let blob = export_keys(&KeyBackupPayload::default(), "pw", &mut rng).unwrap();

    // salt, nonce and ciphertext bytes; the version byte has its own error
    for position in [1, 20, 45, blob.len() - 1] {
        let mut tampered = blob.clone();
        tampered[position] ^= 0x80;
        assert_eq!(import_keys(&tampered, "pw"), Err(BackupError::AuthenticationFailed));
    }
}

#[test]
fn truncation_and_version_errors_are_distinct() {
    let mut rng = ChaCha20Rng::seed_from_u64(4);
    let blob = export_keys(&KeyBackupPayload::default(), "pw", &mut rng).unwrap();

    assert!(matches!(import_keys(&blob[..20], "pw"), Err(BackupError::TooShort { actual: 20, .. })));
    assert_eq!(import_keys(&blob[..blob.len() - 1], "pw"), Err(BackupError::AuthenticationFailed));

    let mut relabelled = blob;
    relabelled[0] = BACKUP_VERSION + 1;
    assert_eq!(import_keys(&relabelled, "pw"), Err(BackupError::UnsupportedVersion(BACKUP_VERSION + 1)));
}

#[test]
fn same_payload_encrypts_differently_each_time() {
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let payload = KeyBackupPayload::default();

    let a = export_keys(&payload, "pw", &mut rng).unwrap();
    let b = export_keys(&payload, "pw", &mut rng).unwrap();
    assert_ne!(a, b);
}

#[test]
fn extra_fields_cannot_shadow_typed_fields() {
    let mut rng = ChaCha20Rng::seed_from_u64(6);

    for field in RESERVED_FIELDS {
        let mut payload = KeyBackupPayload::default();
        payload.extra.insert(field.to_string(), json!(42));

        let err = export_keys(&payload, "pw", &mut rng).unwrap_err();
        assert_eq!(err, BackupError::ReservedField(field.to_string()));
        assert_eq!(err.category(), ErrorCategory::ProtocolViolation);
    }

    // Shadowing a field that is also set would emit a duplicate key
    let mut payload = full_payload(&mut rng);
    payload.extra.insert("signed_pre_key".to_string(), json!({ "key_id": 9 }));
    assert!(matches!(export_keys(&payload, "pw", &mut rng), Err(BackupError::ReservedField(_))));
}
