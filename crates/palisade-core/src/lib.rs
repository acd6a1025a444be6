//! Palisade Group Session Core
//!
//! Stateful orchestration around group encryption. The MLS tree
//! cryptography itself is delegated to an engine behind
//! [`mls::GroupEngine`]; this crate owns credentials, the session lifecycle,
//! epoch bookkeeping and the ordering of control messages.
//!
//! # Message Flow
//!
//! ```text
//! transport bytes
//!        │
//!        ▼
//! GroupInbox ──(future epoch)──> MessageBuffer ──(timeout)──> resync callback
//!        │                              ▲
//!        ▼                              │ drained after each epoch advance
//! GroupSessionManager ──────────────────┘
//!        │
//!        ▼
//! GroupEngine (OpenMLS) → GroupEvent
//! ```
//!
//! The crate never performs network I/O: every operation returns the bytes
//! the caller must deliver.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod buffer;
pub mod env;
pub mod error;
pub mod inbox;
pub mod mls;

pub use buffer::{
    BufferedMessage, DEFAULT_RESYNC_TIMEOUT, MessageBuffer, MessageBufferConfig, MessageKind,
    ResyncCallback,
};
pub use env::{EnvRng, Environment, SystemEnv};
pub use error::{EngineError, GroupError};
pub use inbox::GroupInbox;
pub use mls::{
    AddMemberOutput, GroupEngine, GroupEvent, GroupHandle, GroupId, GroupSessionConfig,
    GroupSessionManager, Member, MlsCredential, OpenMlsEngine, SessionId,
};
