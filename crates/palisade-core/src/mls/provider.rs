//! `OpenMLS` provider integration with the Environment abstraction.
//!
//! Randomness drawn by `OpenMLS` (init keys, HPKE ephemerals, nonces) comes
//! from the same [`Environment`] as the rest of the crate.

use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::{OpenMlsProvider, random::OpenMlsRand};

use crate::env::{EnvRng, Environment};

/// `OpenMLS` provider scoped to one engine session.
///
/// Storage is in memory and owned by the session: key packages generated
/// here can only be consumed by Welcomes processed by the same provider.
pub struct MlsProvider<E: Environment> {
    /// Crypto primitives
    crypto: RustCrypto,

    /// RNG adapter wrapping our environment
    rand: EnvRng<E>,

    /// Key package private keys and group state
    storage: MemoryStorage,
}

impl<E: Environment> MlsProvider<E> {
    /// Provider with empty storage and randomness from `env`.
    pub fn new(env: E) -> Self {
        Self {
            crypto: RustCrypto::default(),
            rand: EnvRng::new(env),
            storage: MemoryStorage::default(),
        }
    }

    /// The environment randomness is drawn from.
    pub fn env(&self) -> &E {
        self.rand.env()
    }
}

impl<E: Environment> OpenMlsRand for EnvRng<E> {
    type Error = std::convert::Infallible;

    fn random_array<const N: usize>(&self) -> Result<[u8; N], Self::Error> {
        let mut bytes = [0u8; N];
        self.env().random_bytes(&mut bytes);
        Ok(bytes)
    }

    fn random_vec(&self, len: usize) -> Result<Vec<u8>, Self::Error> {
        let mut bytes = vec![0u8; len];
        self.env().random_bytes(&mut bytes);
        Ok(bytes)
    }
}

impl<E: Environment> OpenMlsProvider for MlsProvider<E> {
    type CryptoProvider = RustCrypto;
    type RandProvider = EnvRng<E>;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.rand
    }

    fn storage(&self) -> &Self::StorageProvider {
        &self.storage
    }
}
