//! Long-term and medium-term key material.
//!
//! Identity keys are Ed25519 signing keys. Pre-keys are X25519 Diffie-Hellman
//! keys. Identity keys take part in X3DH by mapping them onto Curve25519:
//! the public key through the Edwards-to-Montgomery map and the private key
//! through the SHA-512 expanded scalar, which is what libsodium's
//! `crypto_sign_ed25519_*_to_curve25519` functions compute.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::KeyError;

/// Size of every public key (Ed25519 and X25519).
pub const PUBLIC_KEY_LEN: usize = 32;

/// Size of a private key (Ed25519 seed or X25519 scalar).
pub const PRIVATE_KEY_LEN: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Size of a libsodium-style Ed25519 secret key (`seed || public`).
const EXPANDED_SECRET_KEY_LEN: usize = 64;

/// Validate that `bytes` is exactly `N` long and copy it into an array.
pub(crate) fn fixed<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u8; N], KeyError> {
    bytes.try_into().map_err(|_| KeyError::InvalidKeyLength {
        what,
        expected: N,
        actual: bytes.len(),
    })
}

/// Algorithm tag carried alongside key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Ed25519 signing key
    Ed25519,
    /// X25519 Diffie-Hellman key
    X25519,
}

/// Long-term Ed25519 identity key pair.
///
/// Created once per user. The private half is only ever persisted through
/// [`crate::backup::export_keys`].
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(try_from = "IdentityKeyRecord", into = "IdentityKeyRecord")]
pub struct IdentityKeyPair {
    public: [u8; PUBLIC_KEY_LEN],
    private: [u8; PRIVATE_KEY_LEN],
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Self { public: signing_key.verifying_key().to_bytes(), private: signing_key.to_bytes() }
    }

    /// Import an identity key pair supplied by the identity provider.
    ///
    /// `private` is either the 32-byte seed or the 64-byte `seed || public`
    /// layout. The public half must match the one derived from the seed.
    pub fn from_bytes(public: &[u8], private: &[u8]) -> Result<Self, KeyError> {
        let public: [u8; PUBLIC_KEY_LEN] = fixed(public, "identity public key")?;

        let seed: [u8; PRIVATE_KEY_LEN] = match private.len() {
            PRIVATE_KEY_LEN => fixed(private, "identity private key")?,
            EXPANDED_SECRET_KEY_LEN => {
                if !bool::from(private[PRIVATE_KEY_LEN..].ct_eq(&public)) {
                    return Err(KeyError::KeyPairMismatch);
                }
                fixed(&private[..PRIVATE_KEY_LEN], "identity private key")?
            },
            actual => {
                return Err(KeyError::InvalidKeyLength {
                    what: "identity private key",
                    expected: PRIVATE_KEY_LEN,
                    actual,
                });
            },
        };

        let signing_key = SigningKey::from_bytes(&seed);
        if !bool::from(signing_key.verifying_key().as_bytes().ct_eq(&public)) {
            return Err(KeyError::KeyPairMismatch);
        }

        Ok(Self { public, private: seed })
    }

    /// Algorithm of this key pair.
    pub fn key_type(&self) -> KeyType {
        KeyType::Ed25519
    }

    /// Public signing key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// Private 32-byte seed.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.private
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.private).sign(message).to_bytes()
    }

    /// Curve25519 view of this identity key for X3DH.
    pub(crate) fn dh_key_pair(&self) -> DhKeyPair {
        let scalar = Zeroizing::new(SigningKey::from_bytes(&self.private).to_scalar_bytes());
        DhKeyPair::from_private(*scalar)
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.private.ct_eq(&other.private)) && self.public == other.public
    }
}

impl Eq for IdentityKeyPair {}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityKeyRecord {
    key_type: KeyType,
    #[serde(with = "crate::serde_hex")]
    public_key: [u8; PUBLIC_KEY_LEN],
    #[serde(with = "crate::serde_hex")]
    private_key: [u8; PRIVATE_KEY_LEN],
}

impl TryFrom<IdentityKeyRecord> for IdentityKeyPair {
    type Error = KeyError;

    fn try_from(mut record: IdentityKeyRecord) -> Result<Self, Self::Error> {
        let result = Self::from_bytes(&record.public_key, &record.private_key);
        record.private_key.zeroize();
        result
    }
}

impl From<IdentityKeyPair> for IdentityKeyRecord {
    fn from(pair: IdentityKeyPair) -> Self {
        Self { key_type: pair.key_type(), public_key: pair.public, private_key: pair.private }
    }
}

/// Convert an Ed25519 identity public key into its X25519 form.
pub fn identity_dh_public(identity_public: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 32], KeyError> {
    let verifying_key = VerifyingKey::from_bytes(identity_public)
        .map_err(|_| KeyError::InvalidPublicKey { what: "identity public key" })?;
    Ok(verifying_key.to_montgomery().to_bytes())
}

/// Verify an Ed25519 signature made by an identity key.
pub fn verify_signature(
    identity_public: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), KeyError> {
    let verifying_key = VerifyingKey::from_bytes(identity_public)
        .map_err(|_| KeyError::InvalidPublicKey { what: "identity public key" })?;
    verifying_key
        .verify_strict(message, &Signature::from_bytes(signature))
        .map_err(|_| KeyError::InvalidSignature)
}

/// X25519 key pair used for pre-keys, ephemeral keys and ratchet keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(try_from = "DhKeyRecord", into = "DhKeyRecord")]
pub struct DhKeyPair {
    public: [u8; PUBLIC_KEY_LEN],
    private: [u8; PRIVATE_KEY_LEN],
}

impl DhKeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        Self { public: PublicKey::from(&secret).to_bytes(), private: secret.to_bytes() }
    }

    /// Rebuild a key pair from its private scalar.
    pub fn from_private(private: [u8; PRIVATE_KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private);
        Self { public: PublicKey::from(&secret).to_bytes(), private }
    }

    /// Import a key pair, checking both halves belong together.
    pub fn from_bytes(public: &[u8], private: &[u8]) -> Result<Self, KeyError> {
        let public: [u8; PUBLIC_KEY_LEN] = fixed(public, "pre-key public key")?;
        let pair = Self::from_private(fixed(private, "pre-key private key")?);
        if pair.public != public {
            return Err(KeyError::KeyPairMismatch);
        }
        Ok(pair)
    }

    /// Public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// Private scalar.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.private
    }

    /// X25519 agreement with `peer_public`.
    ///
    /// Rejects low-order peer keys whose output would be all zeros.
    pub fn diffie_hellman(
        &self,
        peer_public: &[u8; PUBLIC_KEY_LEN],
        what: &'static str,
    ) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let shared = StaticSecret::from(self.private).diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(KeyError::InvalidPublicKey { what });
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl PartialEq for DhKeyPair {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.private.ct_eq(&other.private)) && self.public == other.public
    }
}

impl Eq for DhKeyPair {}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct DhKeyRecord {
    #[serde(with = "crate::serde_hex")]
    public_key: [u8; PUBLIC_KEY_LEN],
    #[serde(with = "crate::serde_hex")]
    private_key: [u8; PRIVATE_KEY_LEN],
}

impl TryFrom<DhKeyRecord> for DhKeyPair {
    type Error = KeyError;

    fn try_from(mut record: DhKeyRecord) -> Result<Self, Self::Error> {
        let result = Self::from_bytes(&record.public_key, &record.private_key);
        record.private_key.zeroize();
        result
    }
}

impl From<DhKeyPair> for DhKeyRecord {
    fn from(pair: DhKeyPair) -> Self {
        Self { public_key: pair.public, private_key: pair.private }
    }
}

/// Medium-term pre-key signed by the identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    key_id: u32,
    #[serde(flatten)]
    key_pair: DhKeyPair,
    #[serde(with = "crate::serde_hex")]
    signature: [u8; SIGNATURE_LEN],
    created_at: u64,
}

impl SignedPreKey {
    /// Generate a signed pre-key. `created_at` is milliseconds since the Unix
    /// epoch.
    pub fn generate<R: RngCore + CryptoRng>(
        identity: &IdentityKeyPair,
        key_id: u32,
        created_at: u64,
        rng: &mut R,
    ) -> Self {
        let key_pair = DhKeyPair::generate(rng);
        let signature = identity.sign(key_pair.public_key());
        Self { key_id, key_pair, signature, created_at }
    }

    /// Key identifier.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// The underlying Diffie-Hellman key pair.
    pub fn key_pair(&self) -> &DhKeyPair {
        &self.key_pair
    }

    /// Public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.key_pair.public_key()
    }

    /// Identity signature over the public key.
    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Check the signature against `identity_public`.
    pub fn verify(&self, identity_public: &[u8; PUBLIC_KEY_LEN]) -> Result<(), KeyError> {
        verify_signature(identity_public, self.public_key(), &self.signature)
    }
}

/// Single-use pre-key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    key_id: u32,
    #[serde(flatten)]
    key_pair: DhKeyPair,
}

impl OneTimePreKey {
    /// Generate a one-time pre-key with the given id.
    pub fn generate<R: RngCore + CryptoRng>(key_id: u32, rng: &mut R) -> Self {
        Self { key_id, key_pair: DhKeyPair::generate(rng) }
    }

    /// Key identifier.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// The underlying Diffie-Hellman key pair.
    pub fn key_pair(&self) -> &DhKeyPair {
        &self.key_pair
    }

    /// Public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.key_pair.public_key()
    }
}

/// Generate `count` one-time pre-keys with sequential ids starting at
/// `first_id`.
pub fn generate_one_time_pre_keys<R: RngCore + CryptoRng>(
    first_id: u32,
    count: u32,
    rng: &mut R,
) -> Vec<OneTimePreKey> {
    (0..count).map(|offset| OneTimePreKey::generate(first_id.wrapping_add(offset), rng)).collect()
}

/// Public part of a signed pre-key as published in a [`KeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedSignedPreKey {
    /// Key identifier
    pub key_id: u32,
    /// X25519 public key
    #[serde(with = "crate::serde_hex")]
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Identity signature over `public_key`
    #[serde(with = "crate::serde_hex")]
    pub signature: [u8; SIGNATURE_LEN],
}

/// Public part of a one-time pre-key as published in a [`KeyBundle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedOneTimePreKey {
    /// Key identifier
    pub key_id: u32,
    /// X25519 public key
    #[serde(with = "crate::serde_hex")]
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// Published, non-secret view of a peer's key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Ed25519 identity public key
    #[serde(with = "crate::serde_hex")]
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    /// Signed pre-key
    pub signed_pre_key: PublishedSignedPreKey,
    /// One-time pre-key, absent when the peer has run out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<PublishedOneTimePreKey>,
}

impl KeyBundle {
    /// Build the bundle a user publishes for their own keys.
    pub fn new(
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key: *identity.public_key(),
            signed_pre_key: PublishedSignedPreKey {
                key_id: signed_pre_key.key_id(),
                public_key: *signed_pre_key.public_key(),
                signature: *signed_pre_key.signature(),
            },
            one_time_pre_key: one_time_pre_key.map(|key| PublishedOneTimePreKey {
                key_id: key.key_id(),
                public_key: *key.public_key(),
            }),
        }
    }

    /// Build a bundle from untrusted buffers, validating every length.
    pub fn from_parts(
        identity_key: &[u8],
        signed_pre_key_id: u32,
        signed_pre_key: &[u8],
        signature: &[u8],
        one_time_pre_key: Option<(u32, &[u8])>,
    ) -> Result<Self, KeyError> {
        let one_time_pre_key = one_time_pre_key
            .map(|(key_id, public)| {
                Ok::<_, KeyError>(PublishedOneTimePreKey {
                    key_id,
                    public_key: fixed(public, "one-time pre-key")?,
                })
            })
            .transpose()?;

        Ok(Self {
            identity_key: fixed(identity_key, "identity public key")?,
            signed_pre_key: PublishedSignedPreKey {
                key_id: signed_pre_key_id,
                public_key: fixed(signed_pre_key, "signed pre-key")?,
                signature: fixed(signature, "signed pre-key signature")?,
            },
            one_time_pre_key,
        })
    }

    /// Verify the signed pre-key signature under the bundle's identity key.
    pub fn verify(&self) -> Result<(), KeyError> {
        verify_signature(
            &self.identity_key,
            &self.signed_pre_key.public_key,
            &self.signed_pre_key.signature,
        )
    }
}
