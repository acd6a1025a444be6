//! Group session lifecycle against the `OpenMLS` engine.
//!
//! These tests verify critical invariants:
//! - Adding a member advances the epoch by exactly one on every side
//! - A removed member cannot read anything sent after the removing Commit
//! - Handles from a replaced session are rejected
//! - Out-of-order Commits are applied in epoch order through the inbox

use palisade_core::{
    GroupError, GroupEvent, GroupHandle, GroupId, GroupInbox, GroupSessionManager, MessageBuffer,
    MessageBufferConfig, MessageKind, OpenMlsEngine, SystemEnv,
};
use palisade_crypto::ErrorCategory;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

type Manager = GroupSessionManager<OpenMlsEngine<SystemEnv>>;

fn participant(seed: u8) -> Manager {
    let mut rng = ChaCha20Rng::seed_from_u64(u64::from(seed));
    let mut manager = GroupSessionManager::new(OpenMlsEngine::new(SystemEnv::new()));
    manager.create_credential(&[seed; 32], &mut rng).unwrap();
    manager.create_session().unwrap();
    manager
}

/// Adds `joiner` to the group and returns the joiner's handle plus the Commit
/// existing members must process.
fn invite(inviter: &mut Manager, handle: &GroupHandle, joiner: &mut Manager) -> (GroupHandle, Vec<u8>) {
    let key_package = joiner.generate_key_package().unwrap();
    let output = inviter.add_member(handle, &key_package).unwrap();
    let joined = joiner.process_welcome(&output.welcome).unwrap();
    (joined, output.commit)
}

/// INVARIANT: adding a member advances the epoch by exactly one, and the
/// joiner's view of the membership matches the inviter's.
#[test]
fn add_member_advances_epoch_and_agrees_on_members() {
    let mut alice = participant(1);
    let mut bob = participant(2);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    assert_eq!(alice.epoch(&group).unwrap(), 0);

    let (bob_group, _commit) = invite(&mut alice, &group, &mut bob);

    assert_eq!(alice.epoch(&group).unwrap(), 1);
    assert_eq!(bob.epoch(&bob_group).unwrap(), 1);
    assert_eq!(alice.members(&group).unwrap().len(), 2);
    assert_eq!(bob.members(&bob_group).unwrap(), alice.members(&group).unwrap());
    assert_eq!(bob.own_leaf_index(&bob_group).unwrap(), 1);

    let ciphertext = alice.encrypt_message(&group, b"hello bob").unwrap();
    assert_eq!(
        bob.process_message(&bob_group, &ciphertext).unwrap(),
        GroupEvent::Application { sender: 0, plaintext: b"hello bob".to_vec() }
    );

    let reply = bob.encrypt_message(&bob_group, b"hi alice").unwrap();
    assert_eq!(
        alice.process_message(&group, &reply).unwrap(),
        GroupEvent::Application { sender: 1, plaintext: b"hi alice".to_vec() }
    );
}

/// INVARIANT: removal advances the epoch by exactly one and the removed
/// member cannot decrypt anything encrypted after the Commit.
#[test]
fn removed_member_cannot_decrypt_later_messages() {
    let mut alice = participant(1);
    let mut bob = participant(2);
    let mut carol = participant(3);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let (bob_group, _) = invite(&mut alice, &group, &mut bob);
    let (carol_group, add_carol) = invite(&mut alice, &group, &mut carol);
    assert_eq!(
        bob.process_message(&bob_group, &add_carol).unwrap(),
        GroupEvent::EpochAdvanced { epoch: 2 }
    );

    let remove_bob = alice.remove_member(&group, 1).unwrap();
    assert_eq!(alice.epoch(&group).unwrap(), 3);
    assert_eq!(alice.members(&group).unwrap().len(), 2);

    let after_removal = alice.encrypt_message(&group, b"bob is gone").unwrap();

    // Before seeing the Commit, bob is an epoch behind
    let err = bob.process_message(&bob_group, &after_removal).unwrap_err();
    assert!(matches!(err, GroupError::FutureEpoch { current_epoch: 2, message_epoch: 3, .. }));

    assert_eq!(bob.process_message(&bob_group, &remove_bob).unwrap(), GroupEvent::Removed);
    assert_eq!(
        bob.process_message(&bob_group, &after_removal),
        Err(GroupError::GroupNotFound(bob_group.group_id.clone()))
    );
    assert_eq!(bob.epoch(&bob_group), Err(GroupError::GroupNotFound(bob_group.group_id.clone())));

    assert_eq!(
        carol.process_message(&carol_group, &remove_bob).unwrap(),
        GroupEvent::EpochAdvanced { epoch: 3 }
    );
    assert_eq!(
        carol.process_message(&carol_group, &after_removal).unwrap(),
        GroupEvent::Application { sender: 0, plaintext: b"bob is gone".to_vec() }
    );
}

/// INVARIANT: messages from before a Commit are rejected after it.
#[test]
fn past_epoch_messages_are_rejected() {
    let mut alice = participant(1);
    let mut bob = participant(2);
    let mut carol = participant(3);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let (bob_group, _) = invite(&mut alice, &group, &mut bob);

    let stale = alice.encrypt_message(&group, b"epoch one").unwrap();
    let (_, add_carol) = invite(&mut alice, &group, &mut carol);
    bob.process_message(&bob_group, &add_carol).unwrap();

    let err = bob.process_message(&bob_group, &stale).unwrap_err();
    assert!(matches!(err, GroupError::PastEpoch { current_epoch: 2, message_epoch: 1, .. }));
}

/// INVARIANT: a new session invalidates every handle of the previous one.
#[test]
fn replaced_session_rejects_old_handles() {
    let mut alice = participant(1);
    let mut bob = participant(2);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let (bob_group, _) = invite(&mut alice, &group, &mut bob);
    let ciphertext = alice.encrypt_message(&group, b"for the old session").unwrap();

    let new_session = bob.create_session().unwrap();
    assert_ne!(new_session, bob_group.session);

    let err = bob.process_message(&bob_group, &ciphertext).unwrap_err();
    assert_eq!(
        err,
        GroupError::StaleGroup { group_id: bob_group.group_id.clone(), handle_session: bob_group.session }
    );
    assert_eq!(err.category(), ErrorCategory::ProtocolViolation);

    // Even a handle forged with the new session id finds nothing
    let forged = GroupHandle { session: new_session, group_id: bob_group.group_id.clone() };
    assert_eq!(bob.members(&forged), Err(GroupError::GroupNotFound(forged.group_id.clone())));
}

/// INVARIANT: a Welcome is only accepted by the session that issued the
/// KeyPackage it was built from.
#[test]
fn welcome_requires_key_package_from_same_session() {
    let mut alice = participant(1);
    let mut bob = participant(2);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let key_package = bob.generate_key_package().unwrap();
    bob.create_session().unwrap();

    let output = alice.add_member(&group, &key_package).unwrap();
    let err = bob.process_welcome(&output.welcome).unwrap_err();
    assert!(matches!(err, GroupError::Engine(_)));
    assert!(bob.groups().is_empty());
}

/// INVARIANT: Commits delivered in reverse order are applied in epoch order
/// once the gap closes, and nothing is left buffered.
#[tokio::test(start_paused = true)]
async fn inbox_applies_reordered_commits() {
    let mut alice = participant(1);
    let mut bob = participant(2);
    let mut carol = participant(3);
    let mut dave = participant(4);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let (bob_group, _) = invite(&mut alice, &group, &mut bob);
    let (_, add_carol) = invite(&mut alice, &group, &mut carol);
    let (_, add_dave) = invite(&mut alice, &group, &mut dave);

    let inbox = GroupInbox::new(MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default()));

    let events = inbox.receive(&mut bob, &bob_group, MessageKind::Commit, add_dave).unwrap();
    assert!(events.is_empty());
    assert_eq!(inbox.buffer().len(&bob_group.group_id), 1);
    assert!(inbox.buffer().has_pending_resync(&bob_group.group_id));

    let events = inbox.receive(&mut bob, &bob_group, MessageKind::Commit, add_carol).unwrap();
    assert_eq!(
        events,
        vec![GroupEvent::EpochAdvanced { epoch: 2 }, GroupEvent::EpochAdvanced { epoch: 3 }]
    );
    assert!(inbox.buffer().is_empty());
    assert!(!inbox.buffer().has_pending_resync(&bob_group.group_id));
    assert_eq!(bob.members(&bob_group).unwrap().len(), 4);
}

/// INVARIANT: errors other than a future epoch are surfaced, not buffered.
#[test]
fn inbox_surfaces_malformed_messages() {
    let mut alice = participant(1);
    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let inbox = GroupInbox::new(MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default()));

    let err = inbox.receive(&mut alice, &group, MessageKind::Commit, vec![0xff; 8]).unwrap_err();
    assert!(matches!(err, GroupError::Engine(_)));
    assert!(inbox.buffer().is_empty());
}

/// INVARIANT: a Commit that arrived before the Welcome is applied on join.
#[tokio::test(start_paused = true)]
async fn inbox_join_applies_commit_received_before_welcome() {
    let mut alice = participant(1);
    let mut bob = participant(2);
    let mut carol = participant(3);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let key_package = bob.generate_key_package().unwrap();
    let add_bob = alice.add_member(&group, &key_package).unwrap();
    let (_, add_carol) = invite(&mut alice, &group, &mut carol);

    let inbox = GroupInbox::new(MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default()));
    inbox.buffer().push(&group.group_id, MessageKind::Commit, add_carol, 1);

    let (bob_group, events) = inbox.join(&mut bob, &add_bob.welcome).unwrap();
    assert_eq!(events, vec![GroupEvent::EpochAdvanced { epoch: 2 }]);
    assert_eq!(bob.epoch(&bob_group).unwrap(), 2);
    assert!(inbox.buffer().is_empty());
}

/// INVARIANT: a buffered message that fails once its epoch is reached is
/// reported to the caller, not dropped.
#[tokio::test(start_paused = true)]
async fn inbox_reports_buffered_message_that_fails_on_replay() {
    let mut alice = participant(1);
    let mut bob = participant(2);
    let mut carol = participant(3);
    let mut dave = participant(4);

    let group = alice.create_group(GroupId::from_slice(b"general")).unwrap();
    let (bob_group, _) = invite(&mut alice, &group, &mut bob);
    let (_, add_carol) = invite(&mut alice, &group, &mut carol);
    let (_, mut add_dave) = invite(&mut alice, &group, &mut dave);

    let last = add_dave.len() - 1;
    add_dave[last] ^= 0x01;

    let inbox = GroupInbox::new(MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default()));
    assert!(inbox.receive(&mut bob, &bob_group, MessageKind::Commit, add_dave).unwrap().is_empty());
    assert_eq!(inbox.buffer().len(&bob_group.group_id), 1);

    let events = inbox.receive(&mut bob, &bob_group, MessageKind::Commit, add_carol).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], GroupEvent::EpochAdvanced { epoch: 2 });
    assert!(matches!(
        events[1],
        GroupEvent::Rejected { message_id: 1, error: GroupError::Engine(_) }
    ));

    assert!(inbox.buffer().is_empty());
    assert_eq!(bob.epoch(&bob_group).unwrap(), 2);
}
