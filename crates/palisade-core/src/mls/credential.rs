//! MLS signing credentials.

use palisade_crypto::{IdentityKeyPair, KeyError, MlsCredentialKeys, keys::PUBLIC_KEY_LEN};
use rand::{CryptoRng, RngCore};

/// Identity plus Ed25519 signing key pair used inside MLS groups.
///
/// The identity is the user's long-term identity public key; the signing
/// pair is either fresh or imported from a backup. Key sizes are checked
/// here so the engine never sees a malformed buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct MlsCredential {
    identity: Vec<u8>,
    signing: IdentityKeyPair,
}

impl MlsCredential {
    /// Credential with a freshly generated signing key pair.
    pub fn generate<R: RngCore + CryptoRng>(
        identity_public_key: &[u8],
        rng: &mut R,
    ) -> Result<Self, KeyError> {
        check_identity(identity_public_key)?;
        Ok(Self { identity: identity_public_key.to_vec(), signing: IdentityKeyPair::generate(rng) })
    }

    /// Credential with an imported signing key pair.
    pub fn from_bytes(
        identity_public_key: &[u8],
        signature_public_key: &[u8],
        signature_private_key: &[u8],
    ) -> Result<Self, KeyError> {
        check_identity(identity_public_key)?;
        let signing = IdentityKeyPair::from_bytes(signature_public_key, signature_private_key)?;
        Ok(Self { identity: identity_public_key.to_vec(), signing })
    }

    /// Restore from the backup representation.
    pub fn from_backup(keys: &MlsCredentialKeys) -> Result<Self, KeyError> {
        Self::from_bytes(&keys.identity, &keys.signature_public_key, &keys.signature_private_key)
    }

    /// Backup representation of this credential.
    pub fn to_backup(&self) -> MlsCredentialKeys {
        MlsCredentialKeys {
            identity: self.identity.clone(),
            signature_public_key: *self.signing.public_key(),
            signature_private_key: *self.signing.private_key(),
        }
    }

    /// Identity bytes carried in the MLS `BasicCredential`.
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Ed25519 signature public key.
    pub fn signature_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.signing.public_key()
    }

    pub(crate) fn signature_private_key(&self) -> &[u8; 32] {
        self.signing.private_key()
    }
}

impl std::fmt::Debug for MlsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlsCredential")
            .field("identity", &hex::encode(&self.identity))
            .field("signature_public_key", &hex::encode(self.signing.public_key()))
            .finish_non_exhaustive()
    }
}

fn check_identity(identity_public_key: &[u8]) -> Result<(), KeyError> {
    if identity_public_key.len() != PUBLIC_KEY_LEN {
        return Err(KeyError::InvalidKeyLength {
            what: "credential identity key",
            expected: PUBLIC_KEY_LEN,
            actual: identity_public_key.len(),
        });
    }
    Ok(())
}
