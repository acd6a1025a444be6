//! Error types for Palisade cryptographic operations.
//!
//! Every error reports an [`ErrorCategory`] so callers can tell a protocol
//! violation ("this input can never work") from an authentication failure
//! ("wrong key, wrong passphrase or corrupted data") and from resource
//! exhaustion ("the conversation fell too far out of order, resync it").

use thiserror::Error;

/// Coarse classification shared by every Palisade error type.
///
/// None of these are retryable with the same inputs: all operations are
/// local and deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input, missing state, or misuse of the API.
    ProtocolViolation,
    /// Authenticated decryption failed (tampering, wrong key or passphrase).
    Authentication,
    /// A bounded resource was exhausted and the peer state needs a resync.
    ResourceExhaustion,
}

/// Errors from key material handling and the X3DH handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Key buffer has the wrong size
    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Which key was malformed
        what: &'static str,
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Key bytes do not describe a usable public key
    #[error("invalid {what}")]
    InvalidPublicKey {
        /// Which key was rejected
        what: &'static str,
    },

    /// Signed pre-key signature did not verify under the identity key
    #[error("invalid signed pre-key signature")]
    InvalidSignature,

    /// Private and public halves of an identity key do not belong together
    #[error("identity key pair mismatch: public key does not match private key")]
    KeyPairMismatch,

    /// Required key material is absent
    #[error("missing {what}")]
    MissingKey {
        /// Which key was expected
        what: &'static str,
    },

    /// Referenced pre-key is not (or no longer) held by the store
    #[error("unknown {what} id {id}")]
    UnknownPreKey {
        /// Which pre-key class was looked up
        what: &'static str,
        /// The id that was not found
        id: u32,
    },
}

impl KeyError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::ProtocolViolation
    }
}

/// Errors from the Double Ratchet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// Sending chain not established yet (responder before first message)
    #[error("ratchet not ready: no {chain} chain established")]
    NotReady {
        /// Which chain is missing
        chain: &'static str,
    },

    /// Key material supplied to the ratchet was malformed
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Storing the requested skipped keys would exceed the bound
    #[error("skipped message keys exhausted: {stored} stored, {requested} requested, limit {limit}")]
    SkippedKeyOverflow {
        /// Keys already stored
        stored: usize,
        /// Keys the message would require skipping
        requested: usize,
        /// Maximum number of stored keys
        limit: usize,
    },

    /// No key exists for this message (already consumed, or from a closed chain)
    #[error("no message key available for message {message_number}")]
    MessageKeyUnavailable {
        /// Message number from the header
        message_number: u32,
    },

    /// AEAD authentication failed
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Message counter would wrap
    #[error("message counter overflow at {current}")]
    CounterOverflow {
        /// Counter value when overflow was detected
        current: u32,
    },

    /// Serialized state could not be encoded or decoded
    #[error("ratchet state serialization failed: {0}")]
    Serialization(String),
}

impl RatchetError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DecryptionFailed { .. } | Self::MessageKeyUnavailable { .. } => {
                ErrorCategory::Authentication
            },
            Self::SkippedKeyOverflow { .. } => ErrorCategory::ResourceExhaustion,
            Self::NotReady { .. }
            | Self::Key(_)
            | Self::CounterOverflow { .. }
            | Self::Serialization(_) => ErrorCategory::ProtocolViolation,
        }
    }

    /// Returns true if the session cannot continue without out-of-band action.
    ///
    /// Authentication failures only lose the one message; the session state
    /// is untouched and later messages still decrypt.
    pub fn is_fatal(&self) -> bool {
        self.category() != ErrorCategory::Authentication
    }
}

/// Errors from passphrase-protected key backups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackupError {
    /// Blob is shorter than the fixed header plus authentication tag
    #[error("backup too short: {actual} bytes, need at least {minimum}")]
    TooShort {
        /// Length that was supplied
        actual: usize,
        /// Minimum valid length
        minimum: usize,
    },

    /// Version byte is not one this build understands
    #[error("unsupported backup version: {0}")]
    UnsupportedVersion(u8),

    /// Wrong passphrase or tampered ciphertext
    #[error("backup authentication failed: wrong passphrase or corrupted data")]
    AuthenticationFailed,

    /// Passphrase key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Payload could not be encoded or decoded
    #[error("backup payload serialization failed: {0}")]
    Serialization(String),

    /// An application-defined field shadows a typed backup field
    #[error("extra backup field {0:?} collides with a reserved field")]
    ReservedField(String),

    /// Payload decoded but the key material inside is malformed
    #[error("backup key material invalid: {0}")]
    Key(#[from] KeyError),
}

impl BackupError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationFailed => ErrorCategory::Authentication,
            Self::TooShort { .. }
            | Self::UnsupportedVersion(_)
            | Self::KeyDerivation(_)
            | Self::Serialization(_)
            | Self::ReservedField(_)
            | Self::Key(_) => ErrorCategory::ProtocolViolation,
        }
    }
}
