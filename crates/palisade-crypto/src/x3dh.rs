//! X3DH key agreement.
//!
//! The initiator combines its identity key and a fresh ephemeral key with the
//! responder's published bundle:
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)          (only when a one-time pre-key was used)
//!
//! SK  = HKDF-SHA256(salt = 0^32, ikm = DH1 || DH2 || DH3 [|| DH4], info = X3DH_INFO)
//! ```
//!
//! The responder computes the mirror image from its private keys. The
//! signed pre-key signature is checked before any Diffie-Hellman operation.

use std::fmt;

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::KeyError,
    keys::{DhKeyPair, IdentityKeyPair, KeyBundle, PUBLIC_KEY_LEN, fixed, identity_dh_public},
};

/// HKDF info string binding the derived secret to this protocol.
pub const X3DH_INFO: &[u8] = b"PalisadeX3DH";

/// Size of the agreed secret.
pub const SHARED_SECRET_LEN: usize = 32;

const X3DH_SALT: [u8; 32] = [0u8; 32];

/// Secret agreed by X3DH. Seeds the Double Ratchet root key.
#[derive(Clone)]
pub struct SharedSecret(Zeroizing<[u8; SHARED_SECRET_LEN]>);

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&*other.0))
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Public values the initiator sends so the responder can complete X3DH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhInitiation {
    /// Initiator's Ed25519 identity public key
    #[serde(with = "crate::serde_hex")]
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    /// Initiator's ephemeral X25519 public key
    #[serde(with = "crate::serde_hex")]
    pub ephemeral_key: [u8; PUBLIC_KEY_LEN],
    /// Id of the responder signed pre-key that was used
    pub signed_pre_key_id: u32,
    /// Id of the responder one-time pre-key that was used, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<u32>,
}

/// Result of [`initiate`].
#[derive(Debug)]
pub struct X3dhOutput {
    /// Agreed secret
    pub shared_secret: SharedSecret,
    /// Values to send to the responder
    pub initiation: X3dhInitiation,
}

impl X3dhOutput {
    /// Initiator's ephemeral public key.
    pub fn ephemeral_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.initiation.ephemeral_key
    }
}

/// Run X3DH as the initiator against `peer_bundle`.
///
/// The ephemeral private key is discarded before this returns.
pub fn initiate<R: RngCore + CryptoRng>(
    own_identity: &IdentityKeyPair,
    peer_bundle: &KeyBundle,
    rng: &mut R,
) -> Result<X3dhOutput, KeyError> {
    peer_bundle.verify()?;

    let peer_identity = identity_dh_public(&peer_bundle.identity_key)?;
    let peer_signed_pre_key = &peer_bundle.signed_pre_key.public_key;
    let own_identity_dh = own_identity.dh_key_pair();
    let ephemeral = DhKeyPair::generate(rng);

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * 32));
    ikm.extend_from_slice(&*own_identity_dh.diffie_hellman(peer_signed_pre_key, "signed pre-key")?);
    ikm.extend_from_slice(&*ephemeral.diffie_hellman(&peer_identity, "identity public key")?);
    ikm.extend_from_slice(&*ephemeral.diffie_hellman(peer_signed_pre_key, "signed pre-key")?);
    if let Some(one_time) = &peer_bundle.one_time_pre_key {
        ikm.extend_from_slice(&*ephemeral.diffie_hellman(&one_time.public_key, "one-time pre-key")?);
    } else {
        tracing::debug!("peer bundle has no one-time pre-key, running three-DH X3DH");
    }

    let shared_secret = derive_shared_secret(&ikm);
    let initiation = X3dhInitiation {
        identity_key: *own_identity.public_key(),
        ephemeral_key: *ephemeral.public_key(),
        signed_pre_key_id: peer_bundle.signed_pre_key.key_id,
        one_time_pre_key_id: peer_bundle.one_time_pre_key.as_ref().map(|key| key.key_id),
    };

    Ok(X3dhOutput { shared_secret, initiation })
}

/// Run X3DH as the responder.
///
/// Every buffer is length-checked before use, so malformed peer input yields
/// [`KeyError::InvalidKeyLength`] instead of a panic.
pub fn respond(
    own_identity: &IdentityKeyPair,
    own_signed_pre_key_private: &[u8],
    own_one_time_pre_key_private: Option<&[u8]>,
    peer_identity_public: &[u8],
    peer_ephemeral_public: &[u8],
) -> Result<SharedSecret, KeyError> {
    let signed_pre_key =
        DhKeyPair::from_private(fixed(own_signed_pre_key_private, "signed pre-key private key")?);
    let one_time_pre_key = own_one_time_pre_key_private
        .map(|private| {
            Ok::<_, KeyError>(DhKeyPair::from_private(fixed(
                private,
                "one-time pre-key private key",
            )?))
        })
        .transpose()?;
    let peer_identity = identity_dh_public(&fixed(peer_identity_public, "identity public key")?)?;
    let peer_ephemeral: [u8; PUBLIC_KEY_LEN] = fixed(peer_ephemeral_public, "ephemeral public key")?;
    let own_identity_dh = own_identity.dh_key_pair();

    let mut ikm = Zeroizing::new(Vec::with_capacity(4 * 32));
    ikm.extend_from_slice(&*signed_pre_key.diffie_hellman(&peer_identity, "identity public key")?);
    ikm.extend_from_slice(&*own_identity_dh.diffie_hellman(&peer_ephemeral, "ephemeral public key")?);
    ikm.extend_from_slice(&*signed_pre_key.diffie_hellman(&peer_ephemeral, "ephemeral public key")?);
    if let Some(one_time) = &one_time_pre_key {
        ikm.extend_from_slice(&*one_time.diffie_hellman(&peer_ephemeral, "ephemeral public key")?);
    }

    Ok(derive_shared_secret(&ikm))
}

fn derive_shared_secret(ikm: &[u8]) -> SharedSecret {
    let hkdf = Hkdf::<Sha256>::new(Some(&X3DH_SALT[..]), ikm);
    let mut okm = [0u8; SHARED_SECRET_LEN];
    let Ok(()) = hkdf.expand(X3DH_INFO, &mut okm) else {
        unreachable!("HKDF-SHA256 can expand 32 bytes");
    };
    let secret = SharedSecret::from_bytes(okm);
    okm.zeroize();
    secret
}
