//! Ordered delivery of group control messages.
//!
//! Transport may deliver Commits out of order. [`GroupInbox`] hands each
//! message to the [`GroupSessionManager`]; anything for a future epoch is
//! parked in the [`MessageBuffer`] and replayed once the group reaches that
//! epoch.

use tracing::warn;

use crate::{
    buffer::{BufferedMessage, MessageBuffer, MessageKind},
    env::Environment,
    error::GroupError,
    mls::{GroupEngine, GroupEvent, GroupHandle, GroupSessionManager},
};

/// Applies control messages in epoch order, buffering early arrivals.
#[derive(Debug, Clone)]
pub struct GroupInbox<E: Environment> {
    buffer: MessageBuffer<E>,
}

impl<E: Environment> GroupInbox<E> {
    /// Inbox parking early messages in `buffer`.
    pub fn new(buffer: MessageBuffer<E>) -> Self {
        Self { buffer }
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &MessageBuffer<E> {
        &self.buffer
    }

    /// Deliver one message for the group.
    ///
    /// Returns every event produced, including those from buffered messages
    /// that became applicable. A buffered message that then fails is
    /// reported as [`GroupEvent::Rejected`]. A future-epoch message is
    /// buffered and yields no events. Any other error is returned without
    /// touching the buffer.
    pub fn receive<G: GroupEngine>(
        &self,
        manager: &mut GroupSessionManager<G>,
        handle: &GroupHandle,
        kind: MessageKind,
        payload: Vec<u8>,
    ) -> Result<Vec<GroupEvent>, GroupError> {
        match manager.process_message(handle, &payload) {
            Ok(event) => {
                let mut events = vec![event];
                self.replay_after(manager, handle, &mut events);
                Ok(events)
            },
            Err(GroupError::FutureEpoch { message_epoch, .. }) => {
                self.buffer.push(&handle.group_id, kind, payload, message_epoch);
                Ok(Vec::new())
            },
            Err(err) => Err(err),
        }
    }

    /// Join from a Welcome, then apply anything already buffered for the
    /// group at its joined epoch.
    pub fn join<G: GroupEngine>(
        &self,
        manager: &mut GroupSessionManager<G>,
        welcome: &[u8],
    ) -> Result<(GroupHandle, Vec<GroupEvent>), GroupError> {
        let handle = manager.process_welcome(welcome)?;
        let epoch = manager.epoch(&handle)?;

        let mut events = vec![GroupEvent::EpochAdvanced { epoch }];
        self.replay_after(manager, &handle, &mut events);
        events.remove(0);

        Ok((handle, events))
    }

    /// Apply buffered messages while each applied Commit unlocks more.
    fn replay_after<G: GroupEngine>(
        &self,
        manager: &mut GroupSessionManager<G>,
        handle: &GroupHandle,
        events: &mut Vec<GroupEvent>,
    ) {
        let group_id = &handle.group_id;
        let mut next = events.len() - 1;

        while let Some(event) = events.get(next) {
            next += 1;
            let epoch = match *event {
                GroupEvent::EpochAdvanced { epoch } => epoch,
                GroupEvent::Removed => {
                    for message in self.buffer.drain_all(group_id) {
                        events.push(reject(&message, GroupError::GroupNotFound(group_id.clone())));
                    }
                    return;
                },
                GroupEvent::Application { .. }
                | GroupEvent::ProposalQueued
                | GroupEvent::Rejected { .. } => continue,
            };

            let mut removed = false;
            for message in self.buffer.drain(group_id, epoch) {
                if removed {
                    events.push(reject(&message, GroupError::GroupNotFound(group_id.clone())));
                    continue;
                }

                match manager.process_message(handle, &message.payload) {
                    Ok(event) => {
                        removed = event == GroupEvent::Removed;
                        events.push(event);
                    },
                    Err(GroupError::FutureEpoch { message_epoch, .. }) => {
                        self.buffer.push(group_id, message.kind, message.payload, message_epoch);
                    },
                    Err(error) => events.push(reject(&message, error)),
                }
            }
        }
    }
}

fn reject<I>(message: &BufferedMessage<I>, error: GroupError) -> GroupEvent {
    warn!(
        id = message.id,
        kind = ?message.kind,
        epoch = message.epoch,
        %error,
        "buffered message rejected on replay"
    );
    GroupEvent::Rejected { message_id: message.id, error }
}
