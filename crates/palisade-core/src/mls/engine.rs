//! Capability interface to the MLS group-cryptography engine.
//!
//! The orchestrator only ever talks to the engine through these traits.
//! Everything crossing the boundary is an owned buffer or a small record, so
//! no engine-side reference outlives a call.

use super::{AddMemberOutput, GroupId, Member, credential::MlsCredential};
use crate::error::EngineError;

/// Factory for engine sessions.
pub trait GroupEngine {
    /// Session type produced by this engine.
    type Session: EngineSession;

    /// Start a session bound to `credential`.
    ///
    /// Key packages and groups created by a session are only usable within
    /// that session.
    fn create_session(&self, credential: &MlsCredential) -> Result<Self::Session, EngineError>;
}

/// Routing data read from an encrypted group message without decrypting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Group the message is addressed to
    pub group_id: GroupId,
    /// Epoch the message was sent in
    pub epoch: u64,
}

/// Result of processing one protocol message inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Decrypted application data
    Application {
        /// Sender's leaf index
        sender: u32,
        /// Decrypted plaintext
        plaintext: Vec<u8>,
    },

    /// Proposal stored for a later Commit
    Proposal,

    /// Commit merged into the group state
    Commit {
        /// The Commit removed the local member
        removed_self: bool,
    },
}

/// One credential's view of the engine: its key packages and its groups.
pub trait EngineSession {
    /// Generate a TLS-encoded KeyPackage; its private part stays in the session.
    fn generate_key_package(&mut self) -> Result<Vec<u8>, EngineError>;

    /// Create a group with the local member as its only member, at epoch 0.
    fn create_group(&mut self, group_id: &GroupId) -> Result<(), EngineError>;

    /// Add the owner of `key_package` and merge the resulting Commit locally.
    fn add_member(
        &mut self,
        group_id: &GroupId,
        key_package: &[u8],
    ) -> Result<AddMemberOutput, EngineError>;

    /// Remove the member at `leaf_index` and merge the Commit locally.
    ///
    /// Returns the TLS-encoded Commit.
    fn remove_member(&mut self, group_id: &GroupId, leaf_index: u32)
    -> Result<Vec<u8>, EngineError>;

    /// Join a group from a TLS-encoded Welcome.
    fn process_welcome(&mut self, welcome: &[u8]) -> Result<GroupId, EngineError>;

    /// Encrypt application data for the group's current epoch.
    fn encrypt_message(&mut self, group_id: &GroupId, plaintext: &[u8])
    -> Result<Vec<u8>, EngineError>;

    /// Read group id and epoch of an incoming protocol message.
    fn message_info(&self, message: &[u8]) -> Result<MessageInfo, EngineError>;

    /// Decrypt and apply an incoming protocol message.
    fn process_message(
        &mut self,
        group_id: &GroupId,
        message: &[u8],
    ) -> Result<EngineEvent, EngineError>;

    /// Current epoch of the group.
    fn epoch(&self, group_id: &GroupId) -> Result<u64, EngineError>;

    /// Current members of the group.
    fn members(&self, group_id: &GroupId) -> Result<Vec<Member>, EngineError>;

    /// Leaf index of the local member.
    fn own_leaf_index(&self, group_id: &GroupId) -> Result<u32, EngineError>;

    /// Drop all engine state for the group.
    fn remove_group(&mut self, group_id: &GroupId);
}
