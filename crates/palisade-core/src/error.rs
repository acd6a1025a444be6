//! Error types for group session orchestration.
//!
//! [`EngineError`] comes from the group-cryptography engine boundary.
//! [`GroupError`] is what the orchestrator returns to its caller and wraps
//! engine failures. Both classify into the shared
//! [`ErrorCategory`](palisade_crypto::ErrorCategory).

use palisade_crypto::{ErrorCategory, KeyError};
use thiserror::Error;

use crate::mls::{GroupId, SessionId};

/// Failures reported by a [`GroupEngine`](crate::mls::GroupEngine)
/// implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Input bytes could not be decoded
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What was being decoded
        what: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A message was processed but failed authentication or decryption
    #[error("message rejected: {0}")]
    Rejected(String),

    /// Engine has no state for this group
    #[error("engine has no group {0}")]
    UnknownGroup(GroupId),

    /// Group already exists in this session
    #[error("group {0} already exists")]
    GroupExists(GroupId),

    /// Any other engine operation failure
    #[error("engine operation failed: {0}")]
    Operation(String),
}

impl EngineError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected(_) => ErrorCategory::Authentication,
            Self::Malformed { .. }
            | Self::UnknownGroup(_)
            | Self::GroupExists(_)
            | Self::Operation(_) => ErrorCategory::ProtocolViolation,
        }
    }
}

/// Errors returned by the [`GroupSessionManager`](crate::mls::GroupSessionManager).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// No session exists (never created or destroyed)
    #[error("no active group session")]
    NoActiveSession,

    /// A session needs a credential and none has been set
    #[error("no MLS credential configured")]
    NoCredential,

    /// Group is unknown to the active session
    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    /// Handle belongs to a session that has since been replaced or destroyed
    #[error("group {group_id} belongs to session {handle_session}, not the active session")]
    StaleGroup {
        /// Group the handle refers to
        group_id: GroupId,
        /// Session the handle was issued by
        handle_session: SessionId,
    },

    /// Message is for an epoch the group has not reached yet
    #[error("message for epoch {message_epoch} but group {group_id} is at epoch {current_epoch}")]
    FutureEpoch {
        /// Group the message is for
        group_id: GroupId,
        /// Group's current epoch
        current_epoch: u64,
        /// Epoch carried by the message
        message_epoch: u64,
    },

    /// Message is for an epoch the group has already left
    #[error("message for past epoch {message_epoch}, group {group_id} is at epoch {current_epoch}")]
    PastEpoch {
        /// Group the message is for
        group_id: GroupId,
        /// Group's current epoch
        current_epoch: u64,
        /// Epoch carried by the message
        message_epoch: u64,
    },

    /// Message belongs to a different group than the handle
    #[error("message for group {actual} delivered to group {expected}")]
    GroupMismatch {
        /// Group of the handle
        expected: GroupId,
        /// Group named in the message
        actual: GroupId,
    },

    /// Engine epoch did not advance by exactly one on a commit
    #[error("epoch invariant violated: expected {expected}, engine reports {actual}")]
    EpochMismatch {
        /// Epoch the orchestrator expected
        expected: u64,
        /// Epoch the engine reported
        actual: u64,
    },

    /// Credential material was malformed
    #[error("invalid credential: {0}")]
    Credential(#[from] KeyError),

    /// Engine failure
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl GroupError {
    /// Classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Engine(err) => err.category(),
            Self::Credential(err) => err.category(),
            Self::NoActiveSession
            | Self::NoCredential
            | Self::GroupNotFound(_)
            | Self::StaleGroup { .. }
            | Self::FutureEpoch { .. }
            | Self::PastEpoch { .. }
            | Self::GroupMismatch { .. }
            | Self::EpochMismatch { .. } => ErrorCategory::ProtocolViolation,
        }
    }

    /// Returns true if the message can be retried once the group catches up.
    ///
    /// Only [`GroupError::FutureEpoch`] qualifies; the caller buffers the
    /// message and replays it after the missing commits arrive.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Self::FutureEpoch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_rejection_is_authentication() {
        let err = GroupError::from(EngineError::Rejected("bad tag".to_string()));
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.to_string(), "message rejected: bad tag");
    }

    #[test]
    fn stale_group_is_protocol_violation() {
        let err = GroupError::StaleGroup {
            group_id: GroupId::from_slice(b"room"),
            handle_session: SessionId::new(1),
        };
        assert_eq!(err.category(), ErrorCategory::ProtocolViolation);
        assert!(!err.is_deferrable());
    }

    #[test]
    fn future_epoch_is_deferrable() {
        let err = GroupError::FutureEpoch {
            group_id: GroupId::from_slice(b"room"),
            current_epoch: 1,
            message_epoch: 2,
        };
        assert!(err.is_deferrable());
        assert_eq!(err.to_string(), "message for epoch 2 but group 726f6f6d is at epoch 1");
    }
}
