//! [`GroupEngine`] adapter over `OpenMLS`.

use std::collections::HashMap;

use openmls::{
    group::{GroupId as MlsGroupId, MlsGroup},
    key_packages::KeyPackageIn,
    prelude::{MlsMessageIn, *},
};
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::types::SignatureScheme;
use tls_codec::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    AddMemberOutput, GroupId, GroupSessionConfig, Member,
    credential::MlsCredential,
    engine::{EngineEvent, EngineSession, GroupEngine, MessageInfo},
    provider::MlsProvider,
};
use crate::{env::Environment, error::EngineError};

/// `OpenMLS`-backed engine. Each session gets its own provider and storage.
#[derive(Debug, Clone)]
pub struct OpenMlsEngine<E: Environment> {
    env: E,
    config: GroupSessionConfig,
}

impl<E: Environment> OpenMlsEngine<E> {
    /// Engine with the default ciphersuite and no retained past epochs.
    pub fn new(env: E) -> Self {
        Self::with_config(env, GroupSessionConfig::default())
    }

    /// Engine with explicit group configuration.
    pub fn with_config(env: E, config: GroupSessionConfig) -> Self {
        Self { env, config }
    }
}

impl<E: Environment> GroupEngine for OpenMlsEngine<E> {
    type Session = OpenMlsSession<E>;

    fn create_session(&self, credential: &MlsCredential) -> Result<Self::Session, EngineError> {
        let scheme = self.config.ciphersuite.signature_algorithm();
        if scheme != SignatureScheme::ED25519 {
            return Err(EngineError::Operation(format!(
                "ciphersuite {:?} does not use Ed25519 credentials",
                self.config.ciphersuite
            )));
        }

        let signer = SignatureKeyPair::from_raw(
            scheme,
            credential.signature_private_key().to_vec(),
            credential.signature_public_key().to_vec(),
        );
        let credential_with_key = CredentialWithKey {
            credential: BasicCredential::new(credential.identity().to_vec()).into(),
            signature_key: signer.public().into(),
        };

        Ok(OpenMlsSession {
            provider: MlsProvider::new(self.env.clone()),
            signer,
            credential_with_key,
            config: self.config,
            groups: HashMap::new(),
        })
    }
}

/// One credential's `OpenMLS` state.
pub struct OpenMlsSession<E: Environment> {
    /// Crypto, RNG and key package storage for this session only
    provider: MlsProvider<E>,

    /// Signing key from the credential
    signer: SignatureKeyPair,

    /// Credential embedded in key packages and leaf nodes
    credential_with_key: CredentialWithKey,

    config: GroupSessionConfig,

    groups: HashMap<GroupId, MlsGroup>,
}

impl<E: Environment> OpenMlsSession<E> {
    fn group(&self, group_id: &GroupId) -> Result<&MlsGroup, EngineError> {
        self.groups.get(group_id).ok_or_else(|| EngineError::UnknownGroup(group_id.clone()))
    }
}

fn decode_protocol_message(bytes: &[u8]) -> Result<ProtocolMessage, EngineError> {
    let message = MlsMessageIn::tls_deserialize_exact(bytes)
        .map_err(|e| EngineError::Malformed { what: "group message", reason: e.to_string() })?;

    message
        .try_into()
        .map_err(|e| EngineError::Malformed { what: "group message", reason: format!("{e:?}") })
}

fn serialize(message: &MlsMessageOut, what: &str) -> Result<Vec<u8>, EngineError> {
    message
        .tls_serialize_detached()
        .map_err(|e| EngineError::Operation(format!("failed to serialize {what}: {e}")))
}

impl<E: Environment> EngineSession for OpenMlsSession<E> {
    fn generate_key_package(&mut self) -> Result<Vec<u8>, EngineError> {
        let bundle = KeyPackage::builder()
            .build(
                self.config.ciphersuite,
                &self.provider,
                &self.signer,
                self.credential_with_key.clone(),
            )
            .map_err(|e| EngineError::Operation(format!("failed to build KeyPackage: {e}")))?;

        bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(|e| EngineError::Operation(format!("failed to serialize KeyPackage: {e}")))
    }

    fn create_group(&mut self, group_id: &GroupId) -> Result<(), EngineError> {
        if self.groups.contains_key(group_id) {
            return Err(EngineError::GroupExists(group_id.clone()));
        }

        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(self.config.ciphersuite)
            .use_ratchet_tree_extension(true)
            .max_past_epochs(self.config.max_past_epochs)
            .build();

        let group = MlsGroup::new_with_group_id(
            &self.provider,
            &self.signer,
            &config,
            MlsGroupId::from_slice(group_id.as_slice()),
            self.credential_with_key.clone(),
        )
        .map_err(|e| EngineError::Operation(format!("failed to create group: {e}")))?;

        self.groups.insert(group_id.clone(), group);
        Ok(())
    }

    fn add_member(
        &mut self,
        group_id: &GroupId,
        key_package: &[u8],
    ) -> Result<AddMemberOutput, EngineError> {
        let key_package = KeyPackageIn::tls_deserialize_exact(key_package)
            .map_err(|e| EngineError::Malformed { what: "key package", reason: e.to_string() })?
            .validate(self.provider.crypto(), ProtocolVersion::Mls10)
            .map_err(|e| EngineError::Rejected(format!("invalid KeyPackage: {e:?}")))?;

        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| EngineError::UnknownGroup(group_id.clone()))?;

        let (commit, welcome, _group_info) = group
            .add_members(&self.provider, &self.signer, &[key_package])
            .map_err(|e| EngineError::Operation(format!("failed to add member: {e}")))?;

        group
            .merge_pending_commit(&self.provider)
            .map_err(|e| EngineError::Operation(format!("failed to merge commit: {e}")))?;

        Ok(AddMemberOutput {
            commit: serialize(&commit, "commit")?,
            welcome: serialize(&welcome, "welcome")?,
        })
    }

    fn remove_member(
        &mut self,
        group_id: &GroupId,
        leaf_index: u32,
    ) -> Result<Vec<u8>, EngineError> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| EngineError::UnknownGroup(group_id.clone()))?;

        if leaf_index == group.own_leaf_index().u32() {
            return Err(EngineError::Operation("cannot remove the local member".to_string()));
        }
        if !group.members().any(|m| m.index.u32() == leaf_index) {
            return Err(EngineError::Operation(format!("no member at leaf {leaf_index}")));
        }

        let (commit, _welcome, _group_info) = group
            .remove_members(&self.provider, &self.signer, &[LeafNodeIndex::new(leaf_index)])
            .map_err(|e| EngineError::Operation(format!("failed to remove member: {e}")))?;

        group
            .merge_pending_commit(&self.provider)
            .map_err(|e| EngineError::Operation(format!("failed to merge commit: {e}")))?;

        serialize(&commit, "commit")
    }

    fn process_welcome(&mut self, welcome: &[u8]) -> Result<GroupId, EngineError> {
        let message = MlsMessageIn::tls_deserialize_exact(welcome)
            .map_err(|e| EngineError::Malformed { what: "welcome", reason: e.to_string() })?;

        let MlsMessageBodyIn::Welcome(welcome) = message.extract() else {
            return Err(EngineError::Malformed {
                what: "welcome",
                reason: "message is not a Welcome".to_string(),
            });
        };

        let config = MlsGroupJoinConfig::builder()
            .use_ratchet_tree_extension(true)
            .max_past_epochs(self.config.max_past_epochs)
            .build();

        let staged = StagedWelcome::new_from_welcome(&self.provider, &config, welcome, None)
            .map_err(|e| EngineError::Rejected(format!("failed to stage Welcome: {e}")))?;

        // Joining writes group state to storage, so check before merging
        let group_id = GroupId::from_slice(staged.group_context().group_id().as_slice());
        if self.groups.contains_key(&group_id) {
            return Err(EngineError::GroupExists(group_id));
        }

        let group = staged
            .into_group(&self.provider)
            .map_err(|e| EngineError::Operation(format!("failed to join group: {e}")))?;

        debug!(%group_id, epoch = group.epoch().as_u64(), "staged welcome into group");
        self.groups.insert(group_id.clone(), group);
        Ok(group_id)
    }

    fn encrypt_message(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| EngineError::UnknownGroup(group_id.clone()))?;

        let message = group
            .create_message(&self.provider, &self.signer, plaintext)
            .map_err(|e| EngineError::Operation(format!("failed to create message: {e}")))?;

        serialize(&message, "application message")
    }

    fn message_info(&self, message: &[u8]) -> Result<MessageInfo, EngineError> {
        let message = decode_protocol_message(message)?;
        Ok(MessageInfo {
            group_id: GroupId::from_slice(message.group_id().as_slice()),
            epoch: message.epoch().as_u64(),
        })
    }

    fn process_message(
        &mut self,
        group_id: &GroupId,
        message: &[u8],
    ) -> Result<EngineEvent, EngineError> {
        let message = decode_protocol_message(message)?;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| EngineError::UnknownGroup(group_id.clone()))?;

        let processed = group
            .process_message(&self.provider, message)
            .map_err(|e| EngineError::Rejected(format!("failed to process message: {e}")))?;

        let sender = match processed.sender() {
            Sender::Member(leaf) => Some(leaf.u32()),
            _ => None,
        };

        match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(message) => {
                let Some(sender) = sender else {
                    return Err(EngineError::Rejected(
                        "application message from a non-member".to_string(),
                    ));
                };
                Ok(EngineEvent::Application { sender, plaintext: message.into_bytes() })
            },
            ProcessedMessageContent::ProposalMessage(proposal)
            | ProcessedMessageContent::ExternalJoinProposalMessage(proposal) => {
                group
                    .store_pending_proposal(self.provider.storage(), *proposal)
                    .map_err(|e| EngineError::Operation(format!("failed to store proposal: {e}")))?;
                Ok(EngineEvent::Proposal)
            },
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                group
                    .merge_staged_commit(&self.provider, *staged_commit)
                    .map_err(|e| EngineError::Operation(format!("failed to merge commit: {e}")))?;
                Ok(EngineEvent::Commit { removed_self: !group.is_active() })
            },
        }
    }

    fn epoch(&self, group_id: &GroupId) -> Result<u64, EngineError> {
        Ok(self.group(group_id)?.epoch().as_u64())
    }

    fn members(&self, group_id: &GroupId) -> Result<Vec<Member>, EngineError> {
        Ok(self
            .group(group_id)?
            .members()
            .map(|m| Member {
                leaf_index: m.index.u32(),
                identity: m.credential.serialized_content().to_vec(),
                signature_key: m.signature_key,
            })
            .collect())
    }

    fn own_leaf_index(&self, group_id: &GroupId) -> Result<u32, EngineError> {
        Ok(self.group(group_id)?.own_leaf_index().u32())
    }

    fn remove_group(&mut self, group_id: &GroupId) {
        if let Some(mut group) = self.groups.remove(group_id) {
            if let Err(e) = group.delete(self.provider.storage()) {
                warn!(%group_id, error = %e, "failed to delete group state from storage");
            }
        }
    }
}
