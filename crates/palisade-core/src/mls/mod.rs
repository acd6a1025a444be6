//! Group session orchestration over an MLS engine.
//!
//! The tree cryptography of MLS (RFC 9420) is delegated to a
//! [`GroupEngine`]. This module owns everything around it: credentials,
//! session lifecycle, group handles and epoch bookkeeping.
//!
//! # Components
//!
//! - [`credential`]: MLS signing credential creation and import
//! - [`engine`]: Capability traits the orchestrator drives
//! - [`provider`]: `OpenMLS` provider backed by the [`Environment`](crate::Environment)
//! - [`openmls_engine`]: [`GroupEngine`] adapter over `OpenMLS`
//! - [`session`]: [`GroupSessionManager`], the orchestrator itself

pub mod credential;
pub mod engine;
pub mod openmls_engine;
pub mod provider;
pub mod session;

use std::fmt;

use openmls::prelude::Ciphersuite;

use crate::error::GroupError;

pub use credential::MlsCredential;
pub use engine::{EngineEvent, EngineSession, GroupEngine, MessageInfo};
pub use openmls_engine::{OpenMlsEngine, OpenMlsSession};
pub use provider::MlsProvider;
pub use session::GroupSessionManager;

/// Opaque MLS group identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    /// Group id from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Raw bytes of the group id.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

/// Identifies one engine session of a [`GroupSessionManager`].
///
/// Ids are never reused by a manager, so a handle from a torn-down session
/// can always be told apart from one issued by its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session number.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw session number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to a group, bound to the session that created or joined it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    /// Session the group lives in
    pub session: SessionId,
    /// Group identifier
    pub group_id: GroupId,
}

/// A group member as seen in the ratchet tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Position in the ratchet tree
    pub leaf_index: u32,
    /// Credential identity bytes
    pub identity: Vec<u8>,
    /// Signature public key
    pub signature_key: Vec<u8>,
}

/// Output of adding a member.
///
/// Both messages must be delivered: `commit` is broadcast to existing
/// members, `welcome` goes only to the joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMemberOutput {
    /// TLS-encoded Commit for existing members
    pub commit: Vec<u8>,
    /// TLS-encoded Welcome for the new member
    pub welcome: Vec<u8>,
}

/// Outcome of processing an incoming group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// Decrypted application data
    Application {
        /// Sender's leaf index
        sender: u32,
        /// Decrypted plaintext
        plaintext: Vec<u8>,
    },

    /// A Commit was applied and the group moved to `epoch`
    EpochAdvanced {
        /// The new epoch
        epoch: u64,
    },

    /// A Proposal was stored for a later Commit
    ProposalQueued,

    /// A Commit removed the local member; the group record is gone
    Removed,

    /// A buffered message failed once its epoch was reached.
    ///
    /// Only [`GroupInbox`](crate::inbox::GroupInbox) reports this, for
    /// messages it replayed on the caller's behalf.
    Rejected {
        /// Buffer id of the message
        message_id: u64,
        /// Why processing failed
        error: GroupError,
    },
}

/// Engine configuration applied to every group of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSessionConfig {
    /// MLS ciphersuite for new groups and key packages
    pub ciphersuite: Ciphersuite,

    /// Epochs whose secrets are retained after a Commit.
    ///
    /// Zero means a message from before a Commit can never be decrypted
    /// after it.
    pub max_past_epochs: usize,
}

impl Default for GroupSessionConfig {
    fn default() -> Self {
        Self {
            ciphersuite: Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519,
            max_past_epochs: 0,
        }
    }
}
