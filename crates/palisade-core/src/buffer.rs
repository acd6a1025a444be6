//! Out-of-order buffering of group control messages.
//!
//! A Commit or Proposal that arrives for an epoch the group has not reached
//! yet waits here until the missing Commits are applied. Each group gets a
//! one-shot resync timer per accumulation burst: if the queue is still
//! non-empty when it fires, the resync callback asks the caller to fetch the
//! group state out of band.
//!
//! # Invariants
//!
//! - At most one live timer per group
//! - A timer is cancelled in the same critical section that empties its queue
//! - The callback runs at most once per burst and never under the lock

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{env::Environment, mls::GroupId};

/// Default time a message may wait before a resync is requested.
pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Message buffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBufferConfig {
    /// Delay between the first buffered message of a burst and the resync
    /// callback
    pub resync_timeout: Duration,
}

impl Default for MessageBufferConfig {
    fn default() -> Self {
        Self { resync_timeout: DEFAULT_RESYNC_TIMEOUT }
    }
}

/// Group control message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Commit advancing the epoch
    Commit,
    /// Proposal for a later Commit
    Proposal,
    /// Welcome into a group
    Welcome,
}

/// A control message waiting for its epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage<I> {
    /// Buffer-assigned id, unique per buffer
    pub id: u64,
    /// Message type
    pub kind: MessageKind,
    /// Opaque message bytes
    pub payload: Vec<u8>,
    /// Epoch the message belongs to
    pub epoch: u64,
    /// When the message was buffered
    pub received_at: I,
}

/// Invoked with the group id when a resync timer fires on a non-empty queue.
pub type ResyncCallback = Arc<dyn Fn(&GroupId) + Send + Sync>;

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

struct BufferState<I> {
    queues: HashMap<GroupId, VecDeque<BufferedMessage<I>>>,
    timers: HashMap<GroupId, Timer>,
    next_id: u64,
    next_generation: u64,
}

impl<I> BufferState<I> {
    fn cancel_timer(&mut self, group_id: &GroupId) {
        if let Some(timer) = self.timers.remove(group_id) {
            timer.handle.abort();
        }
    }
}

impl<I> Drop for BufferState<I> {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}

fn lock<I>(state: &Mutex<BufferState<I>>) -> MutexGuard<'_, BufferState<I>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-group queues of out-of-order control messages.
///
/// Cloning yields another handle to the same queues. Timers run on the
/// ambient Tokio runtime; without one, messages are still buffered but no
/// resync is ever requested.
pub struct MessageBuffer<E: Environment> {
    env: E,
    config: MessageBufferConfig,
    state: Arc<Mutex<BufferState<E::Instant>>>,
    on_resync: Option<ResyncCallback>,
}

impl<E: Environment> Clone for MessageBuffer<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            config: self.config,
            state: Arc::clone(&self.state),
            on_resync: self.on_resync.clone(),
        }
    }
}

impl<E: Environment> fmt::Debug for MessageBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MessageBuffer")
            .field("config", &self.config)
            .field("groups", &state.queues.len())
            .field("timers", &state.timers.len())
            .finish_non_exhaustive()
    }
}

impl<E: Environment> MessageBuffer<E> {
    /// Empty buffer without a resync callback.
    pub fn new(env: E, config: MessageBufferConfig) -> Self {
        Self {
            env,
            config,
            state: Arc::new(Mutex::new(BufferState {
                queues: HashMap::new(),
                timers: HashMap::new(),
                next_id: 1,
                next_generation: 0,
            })),
            on_resync: None,
        }
    }

    /// Register the resync callback.
    ///
    /// Applies to timers started after this call.
    #[must_use]
    pub fn with_resync_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&GroupId) + Send + Sync + 'static,
    {
        self.on_resync = Some(Arc::new(callback));
        self
    }

    /// Buffer a message and start the group's resync timer if none is running.
    ///
    /// Returns the id assigned to the message.
    pub fn push(&self, group_id: &GroupId, kind: MessageKind, payload: Vec<u8>, epoch: u64) -> u64 {
        let mut state = lock(&self.state);

        let id = state.next_id;
        state.next_id += 1;

        let message = BufferedMessage { id, kind, payload, epoch, received_at: self.env.now() };
        let queue = state.queues.entry(group_id.clone()).or_default();
        queue.push_back(message);
        let queued = queue.len();

        if !state.timers.contains_key(group_id) {
            self.start_timer(&mut state, group_id);
        }

        debug!(%group_id, id, ?kind, epoch, queued, "buffered control message");
        id
    }

    /// Remove and return, in receipt order, the group's messages for `epoch`.
    ///
    /// Messages for other epochs stay queued.
    pub fn drain(&self, group_id: &GroupId, epoch: u64) -> Vec<BufferedMessage<E::Instant>> {
        let mut state = lock(&self.state);
        let Some(queue) = state.queues.get_mut(group_id) else {
            return Vec::new();
        };

        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            queue.drain(..).partition(|m| m.epoch == epoch);
        *queue = rest;

        if queue.is_empty() {
            state.queues.remove(group_id);
            state.cancel_timer(group_id);
        }

        if !matching.is_empty() {
            debug!(%group_id, epoch, drained = matching.len(), "drained buffered messages");
        }
        matching.into()
    }

    /// Remove and return every queued message for the group.
    pub fn drain_all(&self, group_id: &GroupId) -> Vec<BufferedMessage<E::Instant>> {
        let mut state = lock(&self.state);
        state.cancel_timer(group_id);
        state.queues.remove(group_id).map(Vec::from).unwrap_or_default()
    }

    /// Drop messages buffered longer than `max_age`.
    ///
    /// Queues left empty are removed along with their timers. Returns the
    /// number of messages dropped.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let now = self.env.now();
        let mut state = lock(&self.state);

        let mut pruned = 0;
        let mut emptied = Vec::new();
        for (group_id, queue) in &mut state.queues {
            let before = queue.len();
            queue.retain(|m| now - m.received_at <= max_age);
            pruned += before - queue.len();
            if queue.is_empty() {
                emptied.push(group_id.clone());
            }
        }

        for group_id in &emptied {
            state.queues.remove(group_id);
            state.cancel_timer(group_id);
        }

        if pruned > 0 {
            debug!(pruned, emptied = emptied.len(), "pruned stale buffered messages");
        }
        pruned
    }

    /// Number of messages queued for the group.
    pub fn len(&self, group_id: &GroupId) -> usize {
        lock(&self.state).queues.get(group_id).map_or(0, VecDeque::len)
    }

    /// Returns true if nothing is buffered for any group.
    pub fn is_empty(&self) -> bool {
        lock(&self.state).queues.is_empty()
    }

    /// Returns true if the group has a resync timer running.
    pub fn has_pending_resync(&self, group_id: &GroupId) -> bool {
        lock(&self.state).timers.contains_key(group_id)
    }

    fn start_timer(&self, state: &mut BufferState<E::Instant>, group_id: &GroupId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%group_id, "no async runtime, resync timer not scheduled");
            return;
        };

        let generation = state.next_generation;
        state.next_generation += 1;

        let env = self.env.clone();
        let timeout = self.config.resync_timeout;
        let shared = Arc::downgrade(&self.state);
        let callback = self.on_resync.clone();
        let group = group_id.clone();

        let task = runtime.spawn(async move {
            env.sleep(timeout).await;
            fire_timer(&shared, &group, generation, callback.as_ref());
        });

        state.timers.insert(group_id.clone(), Timer { generation, handle: task.abort_handle() });
    }
}

fn fire_timer<I>(
    shared: &Weak<Mutex<BufferState<I>>>,
    group_id: &GroupId,
    generation: u64,
    callback: Option<&ResyncCallback>,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let pending = {
        let mut state = lock(&shared);
        match state.timers.get(group_id) {
            Some(timer) if timer.generation == generation => {},
            _ => return,
        }
        state.timers.remove(group_id);
        state.queues.get(group_id).map_or(0, VecDeque::len)
    };

    if pending == 0 {
        return;
    }

    warn!(%group_id, pending, "buffered messages not consumed, requesting resync");
    if let Some(callback) = callback {
        callback(group_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::env::SystemEnv;

    fn group(name: &str) -> GroupId {
        GroupId::from_slice(name.as_bytes())
    }

    fn counting_buffer() -> (MessageBuffer<SystemEnv>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let buffer = MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default())
            .with_resync_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        (buffer, fired)
    }

    #[test]
    fn drain_returns_matching_epoch_in_order() {
        let buffer = MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default());
        let g = group("g");

        let first = buffer.push(&g, MessageKind::Commit, b"a".to_vec(), 1);
        let later = buffer.push(&g, MessageKind::Commit, b"b".to_vec(), 2);
        let second = buffer.push(&g, MessageKind::Proposal, b"c".to_vec(), 1);

        let drained = buffer.drain(&g, 1);
        assert_eq!(drained.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(buffer.len(&g), 1);

        let rest = buffer.drain(&g, 2);
        assert_eq!(rest[0].id, later);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_all_empties_only_that_group() {
        let buffer = MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default());
        buffer.push(&group("a"), MessageKind::Commit, vec![1], 3);
        buffer.push(&group("a"), MessageKind::Commit, vec![2], 4);
        buffer.push(&group("b"), MessageKind::Welcome, vec![3], 0);

        assert_eq!(buffer.drain_all(&group("a")).len(), 2);
        assert_eq!(buffer.len(&group("a")), 0);
        assert_eq!(buffer.len(&group("b")), 1);
    }

    #[test]
    fn buffering_works_without_runtime() {
        let buffer = MessageBuffer::new(SystemEnv::new(), MessageBufferConfig::default());
        buffer.push(&group("g"), MessageKind::Commit, vec![], 1);

        assert_eq!(buffer.len(&group("g")), 1);
        assert!(!buffer.has_pending_resync(&group("g")));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_fires_once_per_burst() {
        let (buffer, fired) = counting_buffer();
        let g = group("g");

        buffer.push(&g, MessageKind::Commit, vec![], 5);
        tokio::time::sleep(Duration::from_secs(30)).await;
        buffer.push(&g, MessageKind::Commit, vec![], 6);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!buffer.has_pending_resync(&g));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        buffer.push(&g, MessageKind::Commit, vec![], 7);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_first_cancels_resync() {
        let (buffer, fired) = counting_buffer();
        let g = group("g");

        buffer.push(&g, MessageKind::Commit, vec![], 2);
        assert!(buffer.has_pending_resync(&g));

        tokio::time::sleep(Duration::from_secs(59)).await;
        buffer.drain(&g, 2);
        assert!(!buffer.has_pending_resync(&g));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_drain_keeps_timer() {
        let (buffer, fired) = counting_buffer();
        let g = group("g");

        buffer.push(&g, MessageKind::Commit, vec![], 2);
        buffer.push(&g, MessageKind::Commit, vec![], 3);
        buffer.drain(&g, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_stale_removes_only_old_entries() {
        let (buffer, fired) = counting_buffer();
        let g = group("g");

        buffer.push(&g, MessageKind::Commit, b"old".to_vec(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        buffer.push(&g, MessageKind::Commit, b"new".to_vec(), 2);

        assert_eq!(buffer.prune_stale(Duration::from_secs(5)), 1);
        assert_eq!(buffer.len(&g), 1);
        assert!(buffer.has_pending_resync(&g));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(buffer.prune_stale(Duration::from_secs(5)), 1);
        assert_eq!(buffer.len(&g), 0);
        assert!(buffer.is_empty());
        assert!(!buffer.has_pending_resync(&g));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_are_independent_per_group() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fired);
        let buffer = MessageBuffer::new(
            SystemEnv::new(),
            MessageBufferConfig { resync_timeout: Duration::from_secs(10) },
        )
        .with_resync_callback(move |group_id| log.lock().unwrap().push(group_id.clone()));

        buffer.push(&group("a"), MessageKind::Commit, vec![], 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        buffer.push(&group("b"), MessageKind::Commit, vec![], 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*fired.lock().unwrap(), vec![group("a")]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*fired.lock().unwrap(), vec![group("a"), group("b")]);
    }
}
