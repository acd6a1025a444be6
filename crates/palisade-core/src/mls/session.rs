//! The group session orchestrator.
//!
//! [`GroupSessionManager`] owns at most one engine session. Creating a new
//! session tears down the old one; handles issued by the old session keep
//! their [`SessionId`] and fail with [`GroupError::StaleGroup`] from then on.
//!
//! # Invariants
//!
//! - Epoch of a group increases by exactly one per applied Commit
//! - No operation against an unknown group or absent session is a no-op
//! - Engine state never crosses a session boundary

use std::collections::HashMap;

use palisade_crypto::MlsCredentialKeys;
use rand::{CryptoRng, RngCore};
use tracing::{debug, info, warn};

use super::{
    AddMemberOutput, GroupEvent, GroupHandle, GroupId, Member, SessionId,
    credential::MlsCredential,
    engine::{EngineEvent, EngineSession, GroupEngine},
};
use crate::error::GroupError;

struct ActiveSession<S> {
    id: SessionId,
    engine: S,
    /// Last epoch observed per group
    epochs: HashMap<GroupId, u64>,
}

/// Orchestrates one user's group sessions on top of a [`GroupEngine`].
///
/// All methods take `&mut self`: Commit application is serialized by
/// ownership. Wrap the manager in a mutex or give it to a single task when
/// it must be shared.
pub struct GroupSessionManager<G: GroupEngine> {
    engine: G,
    credential: Option<MlsCredential>,
    active: Option<ActiveSession<G::Session>>,
    next_session: u64,
}

impl<G: GroupEngine> GroupSessionManager<G> {
    /// Manager with no credential and no session.
    pub fn new(engine: G) -> Self {
        Self { engine, credential: None, active: None, next_session: 1 }
    }

    /// Generate a fresh signing credential for `identity_public_key`.
    ///
    /// Takes effect for the next session; the active session keeps the
    /// credential it was created with.
    pub fn create_credential<R: RngCore + CryptoRng>(
        &mut self,
        identity_public_key: &[u8],
        rng: &mut R,
    ) -> Result<&MlsCredential, GroupError> {
        let credential = MlsCredential::generate(identity_public_key, rng)?;
        Ok(&*self.credential.insert(credential))
    }

    /// Import a signing credential, validating key sizes and pairing.
    pub fn import_credential(
        &mut self,
        identity_public_key: &[u8],
        signature_public_key: &[u8],
        signature_private_key: &[u8],
    ) -> Result<&MlsCredential, GroupError> {
        let credential = MlsCredential::from_bytes(
            identity_public_key,
            signature_public_key,
            signature_private_key,
        )?;
        Ok(&*self.credential.insert(credential))
    }

    /// Import a credential from its backup representation.
    pub fn restore_credential(
        &mut self,
        keys: &MlsCredentialKeys,
    ) -> Result<&MlsCredential, GroupError> {
        let credential = MlsCredential::from_backup(keys)?;
        Ok(&*self.credential.insert(credential))
    }

    /// Current credential, if any.
    pub fn credential(&self) -> Option<&MlsCredential> {
        self.credential.as_ref()
    }

    /// Start a new engine session, tearing down the current one first.
    pub fn create_session(&mut self) -> Result<SessionId, GroupError> {
        if self.credential.is_none() {
            return Err(GroupError::NoCredential);
        }

        self.destroy_session();
        let credential = self.credential.as_ref().ok_or(GroupError::NoCredential)?;
        let engine = self.engine.create_session(credential)?;

        let id = SessionId::new(self.next_session);
        self.next_session += 1;
        self.active = Some(ActiveSession { id, engine, epochs: HashMap::new() });

        debug!(session = %id, "created group session");
        Ok(id)
    }

    /// Tear down the active session and all of its groups.
    ///
    /// Returns the destroyed session's id, or `None` if there was none.
    pub fn destroy_session(&mut self) -> Option<SessionId> {
        let mut session = self.active.take()?;
        for group_id in session.epochs.keys() {
            session.engine.remove_group(group_id);
        }
        debug!(session = %session.id, groups = session.epochs.len(), "destroyed group session");
        Some(session.id)
    }

    /// Id of the active session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|s| s.id)
    }

    /// Generate a KeyPackage owned by the active session.
    ///
    /// A Welcome built from it can only be processed by this same session.
    pub fn generate_key_package(&mut self) -> Result<Vec<u8>, GroupError> {
        let session = self.active.as_mut().ok_or(GroupError::NoActiveSession)?;
        Ok(session.engine.generate_key_package()?)
    }

    /// Create a group with the local member as sole member, at epoch 0.
    pub fn create_group(&mut self, group_id: GroupId) -> Result<GroupHandle, GroupError> {
        let session = self.active.as_mut().ok_or(GroupError::NoActiveSession)?;

        session.engine.create_group(&group_id)?;
        let epoch = session.engine.epoch(&group_id)?;
        session.epochs.insert(group_id.clone(), epoch);

        info!(%group_id, session = %session.id, epoch, "created group");
        Ok(GroupHandle { session: session.id, group_id })
    }

    /// Add a member by KeyPackage. The local epoch advances by one.
    ///
    /// Broadcast the Commit to existing members and send the Welcome to the
    /// joiner only.
    pub fn add_member(
        &mut self,
        handle: &GroupHandle,
        key_package: &[u8],
    ) -> Result<AddMemberOutput, GroupError> {
        let session = self.session_for(handle)?;
        let before = group_epoch(session, &handle.group_id)?;

        let output = session.engine.add_member(&handle.group_id, key_package)?;
        let epoch = advance_epoch(session, &handle.group_id, before)?;

        info!(group_id = %handle.group_id, epoch, "added member");
        Ok(output)
    }

    /// Remove the member at `leaf_index`. The local epoch advances by one.
    ///
    /// Returns the Commit to broadcast.
    pub fn remove_member(
        &mut self,
        handle: &GroupHandle,
        leaf_index: u32,
    ) -> Result<Vec<u8>, GroupError> {
        let session = self.session_for(handle)?;
        let before = group_epoch(session, &handle.group_id)?;

        let commit = session.engine.remove_member(&handle.group_id, leaf_index)?;
        let epoch = advance_epoch(session, &handle.group_id, before)?;

        info!(group_id = %handle.group_id, leaf_index, epoch, "removed member");
        Ok(commit)
    }

    /// Join a group from a Welcome addressed to a KeyPackage of this session.
    pub fn process_welcome(&mut self, welcome: &[u8]) -> Result<GroupHandle, GroupError> {
        let session = self.active.as_mut().ok_or(GroupError::NoActiveSession)?;

        let group_id = session.engine.process_welcome(welcome)?;
        let epoch = session.engine.epoch(&group_id)?;
        session.epochs.insert(group_id.clone(), epoch);

        info!(%group_id, session = %session.id, epoch, "joined group from welcome");
        Ok(GroupHandle { session: session.id, group_id })
    }

    /// Encrypt application data at the group's current epoch.
    pub fn encrypt_message(
        &mut self,
        handle: &GroupHandle,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, GroupError> {
        let session = self.session_for(handle)?;
        group_epoch(session, &handle.group_id)?;
        Ok(session.engine.encrypt_message(&handle.group_id, plaintext)?)
    }

    /// Process an incoming application message, Proposal or Commit.
    ///
    /// Messages from a future epoch fail with [`GroupError::FutureEpoch`]
    /// before the engine sees them, so the caller can buffer and retry.
    /// Messages from a past epoch fail with [`GroupError::PastEpoch`]: no
    /// decrypted content survives a Commit boundary.
    pub fn process_message(
        &mut self,
        handle: &GroupHandle,
        message: &[u8],
    ) -> Result<GroupEvent, GroupError> {
        let session = self.session_for(handle)?;
        let group_id = &handle.group_id;
        let current_epoch = group_epoch(session, group_id)?;

        let info = session.engine.message_info(message)?;
        if info.group_id != *group_id {
            return Err(GroupError::GroupMismatch {
                expected: group_id.clone(),
                actual: info.group_id,
            });
        }
        if info.epoch > current_epoch {
            return Err(GroupError::FutureEpoch {
                group_id: group_id.clone(),
                current_epoch,
                message_epoch: info.epoch,
            });
        }
        if info.epoch < current_epoch {
            return Err(GroupError::PastEpoch {
                group_id: group_id.clone(),
                current_epoch,
                message_epoch: info.epoch,
            });
        }

        match session.engine.process_message(group_id, message)? {
            EngineEvent::Application { sender, plaintext } => {
                Ok(GroupEvent::Application { sender, plaintext })
            },
            EngineEvent::Proposal => {
                debug!(%group_id, epoch = current_epoch, "queued proposal");
                Ok(GroupEvent::ProposalQueued)
            },
            EngineEvent::Commit { removed_self: true } => {
                session.engine.remove_group(group_id);
                session.epochs.remove(group_id);
                info!(%group_id, epoch = current_epoch, "removed from group by commit");
                Ok(GroupEvent::Removed)
            },
            EngineEvent::Commit { removed_self: false } => {
                let epoch = advance_epoch(session, group_id, current_epoch)?;
                info!(%group_id, epoch, "applied commit");
                Ok(GroupEvent::EpochAdvanced { epoch })
            },
        }
    }

    /// Current epoch of the group.
    pub fn epoch(&self, handle: &GroupHandle) -> Result<u64, GroupError> {
        let session = self.session_ref(handle)?;
        group_epoch(session, &handle.group_id)
    }

    /// Current members of the group.
    pub fn members(&self, handle: &GroupHandle) -> Result<Vec<Member>, GroupError> {
        let session = self.session_ref(handle)?;
        if !session.epochs.contains_key(&handle.group_id) {
            return Err(GroupError::GroupNotFound(handle.group_id.clone()));
        }
        Ok(session.engine.members(&handle.group_id)?)
    }

    /// Local member's leaf index in the group.
    pub fn own_leaf_index(&self, handle: &GroupHandle) -> Result<u32, GroupError> {
        let session = self.session_ref(handle)?;
        if !session.epochs.contains_key(&handle.group_id) {
            return Err(GroupError::GroupNotFound(handle.group_id.clone()));
        }
        Ok(session.engine.own_leaf_index(&handle.group_id)?)
    }

    /// Handles for every group in the active session.
    pub fn groups(&self) -> Vec<GroupHandle> {
        let Some(session) = &self.active else {
            return Vec::new();
        };
        let mut ids: Vec<&GroupId> = session.epochs.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|group_id| GroupHandle { session: session.id, group_id: group_id.clone() })
            .collect()
    }

    fn session_for(
        &mut self,
        handle: &GroupHandle,
    ) -> Result<&mut ActiveSession<G::Session>, GroupError> {
        let session = self.active.as_mut().ok_or(GroupError::NoActiveSession)?;
        check_handle(session.id, handle)?;
        Ok(session)
    }

    fn session_ref(&self, handle: &GroupHandle) -> Result<&ActiveSession<G::Session>, GroupError> {
        let session = self.active.as_ref().ok_or(GroupError::NoActiveSession)?;
        check_handle(session.id, handle)?;
        Ok(session)
    }
}

fn check_handle(active: SessionId, handle: &GroupHandle) -> Result<(), GroupError> {
    if handle.session != active {
        warn!(
            group_id = %handle.group_id,
            handle_session = %handle.session,
            active_session = %active,
            "operation on group from a previous session"
        );
        return Err(GroupError::StaleGroup {
            group_id: handle.group_id.clone(),
            handle_session: handle.session,
        });
    }
    Ok(())
}

fn group_epoch<S>(session: &ActiveSession<S>, group_id: &GroupId) -> Result<u64, GroupError> {
    session.epochs.get(group_id).copied().ok_or_else(|| GroupError::GroupNotFound(group_id.clone()))
}

/// Record the engine's new epoch after a Commit, which must be `before + 1`.
fn advance_epoch<S: EngineSession>(
    session: &mut ActiveSession<S>,
    group_id: &GroupId,
    before: u64,
) -> Result<u64, GroupError> {
    let expected = before + 1;
    let actual = session.engine.epoch(group_id)?;
    if actual != expected {
        return Err(GroupError::EpochMismatch { expected, actual });
    }
    session.epochs.insert(group_id.clone(), actual);
    Ok(actual)
}
