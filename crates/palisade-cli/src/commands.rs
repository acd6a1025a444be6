//! Subcommand implementations.
//!
//! Secrets only ever leave the process encrypted. Summaries log key ids and
//! public keys; private halves are never formatted.

use std::{
    fs,
    path::{Path, PathBuf},
};

use palisade_core::{EnvRng, Environment, MlsCredential, SystemEnv};
use palisade_crypto::{
    BackupError, IdentityKeyPair, KeyBackupPayload, KeyBundle, KeyError, PreKeyStore, export_keys,
    import_keys,
};
use thiserror::Error;
use tracing::info;

/// Errors surfaced to the operator.
#[derive(Debug, Error)]
pub enum CliError {
    /// Passphrase variable unset or empty
    #[error("environment variable {var} is unset or empty")]
    MissingPassphrase {
        /// Variable name
        var: String,
    },

    /// Refusing to overwrite an existing file
    #[error("{} already exists, pass --force to overwrite", path.display())]
    OutputExists {
        /// Existing file
        path: PathBuf,
    },

    /// File read or write failed
    #[error("failed to access {}: {source}", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Backup could not be encrypted or decrypted
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Key material in the backup is invalid or incomplete
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Bundle could not be encoded
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Non-secret view of a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    /// Identity public key, hex
    pub identity_key: Option<String>,
    /// Signed pre-key id and creation time in Unix milliseconds
    pub signed_pre_key: Option<(u32, u64)>,
    /// Ids of the unused one-time pre-keys
    pub one_time_pre_key_ids: Vec<u32>,
    /// MLS credential signature public key, hex
    pub mls_signature_key: Option<String>,
    /// Names of application-defined fields
    pub extra_fields: Vec<String>,
}

impl BackupSummary {
    fn of(payload: &KeyBackupPayload) -> Self {
        Self {
            identity_key: payload.identity_key.as_ref().map(|k| hex::encode(k.public_key())),
            signed_pre_key: payload.signed_pre_key.as_ref().map(|k| (k.key_id(), k.created_at())),
            one_time_pre_key_ids: payload.one_time_pre_keys.iter().map(|k| k.key_id()).collect(),
            mls_signature_key: payload
                .mls_credential
                .as_ref()
                .map(|c| hex::encode(c.signature_public_key)),
            extra_fields: payload.extra.keys().cloned().collect(),
        }
    }
}

/// Read the backup passphrase from the named environment variable.
pub fn read_passphrase(var: &str) -> Result<String, CliError> {
    match std::env::var(var) {
        Ok(passphrase) if !passphrase.is_empty() => Ok(passphrase),
        _ => Err(CliError::MissingPassphrase { var: var.to_string() }),
    }
}

/// Generate a full key set and write it as an encrypted backup.
pub fn keygen(
    out: &Path,
    one_time_keys: u32,
    force: bool,
    passphrase: &str,
) -> Result<BackupSummary, CliError> {
    ensure_writable(out, force)?;

    let env = SystemEnv::new();
    let mut rng = EnvRng::new(env);

    let mut store =
        PreKeyStore::new(IdentityKeyPair::generate(&mut rng), env.wall_clock_millis(), &mut rng);
    store.replenish_one_time_pre_keys(one_time_keys, &mut rng);
    let credential = MlsCredential::generate(store.identity().public_key(), &mut rng)?;

    let mut payload = store.to_backup_payload();
    payload.mls_credential = Some(credential.to_backup());

    let blob = export_keys(&payload, passphrase, &mut rng)?;
    write(out, &blob)?;

    let summary = BackupSummary::of(&payload);
    info!(
        path = %out.display(),
        identity = summary.identity_key.as_deref().unwrap_or_default(),
        one_time_pre_keys = summary.one_time_pre_key_ids.len(),
        "wrote encrypted key backup"
    );
    Ok(summary)
}

/// Decrypt a backup and log what it holds.
pub fn inspect(backup: &Path, passphrase: &str) -> Result<BackupSummary, CliError> {
    let payload = import_keys(&read(backup)?, passphrase)?;
    let summary = BackupSummary::of(&payload);

    info!(identity = ?summary.identity_key, "identity key");
    if let Some((key_id, created_at)) = summary.signed_pre_key {
        info!(key_id, created_at, "signed pre-key");
    }
    info!(
        count = summary.one_time_pre_key_ids.len(),
        first = ?summary.one_time_pre_key_ids.first(),
        last = ?summary.one_time_pre_key_ids.last(),
        "one-time pre-keys"
    );
    info!(signature_key = ?summary.mls_signature_key, "MLS credential");
    if !summary.extra_fields.is_empty() {
        info!(fields = ?summary.extra_fields, "application fields");
    }

    Ok(summary)
}

/// Write the publishable key bundle of a backup as JSON.
pub fn bundle(
    backup: &Path,
    out: &Path,
    force: bool,
    passphrase: &str,
) -> Result<KeyBundle, CliError> {
    ensure_writable(out, force)?;

    let payload = import_keys(&read(backup)?, passphrase)?;
    let store = PreKeyStore::from_backup_payload(&payload)?;
    let bundle = store.bundle();

    write(out, &serde_json::to_vec_pretty(&bundle)?)?;
    info!(
        path = %out.display(),
        signed_pre_key_id = bundle.signed_pre_key.key_id,
        one_time_pre_key_id = ?bundle.one_time_pre_key.as_ref().map(|k| k.key_id),
        "wrote key bundle"
    );
    Ok(bundle)
}

fn ensure_writable(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::OutputExists { path: path.to_path_buf() });
    }
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::Io { path: path.to_path_buf(), source })
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    fs::write(path, bytes).map_err(|source| CliError::Io { path: path.to_path_buf(), source })
}
