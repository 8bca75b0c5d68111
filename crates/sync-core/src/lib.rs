//! State synchronization core for a terminal chat client.
//!
//! Raw backend events are normalized into typed updates, reconciled by a
//! single-writer engine into an entity store, and projected into render-ready
//! rows. Nothing in this crate performs I/O; the runtime crate drives it.

/// Engine tuning knobs and their defaults.
pub mod config;
/// Download priority slot allocation.
pub mod downloads;
/// The synchronization engine.
pub mod engine;
/// Stable sync error types and backend code classification.
pub mod error;
/// Bounded ingress queue with overflow accounting.
pub mod ingress;
/// Raw backend event to typed update mapping.
pub mod normalization;
/// View model projection.
pub mod projector;
/// Request correlation, timeouts and wire request builders.
pub mod requests;
/// Backoff policy used by resync retries.
pub mod retry;
/// Per-chat synchronization state machine.
pub mod state_machine;
/// Normalized entity store.
pub mod store;
/// Timeline windows and live update buffering.
pub mod timeline;
/// Entities, updates and intents.
pub mod types;

pub use config::EngineConfig;
pub use engine::{Change, Engine, Step};
pub use error::{SyncError, SyncErrorCategory, classify_backend_code};
pub use ingress::{Drained, EngineInput, IngressQueue, Overflow, PushOutcome};
pub use normalization::{Normalized, normalize, normalize_logged};
pub use projector::{ChatRow, MessageRow, RowKind, StatusLine, ViewProjector, ViewSnapshot};
pub use requests::{RequestKind, RequestTimeouts, RequestTracker};
pub use retry::RetryPolicy;
pub use state_machine::{ChatStateMachine, ChatSyncState};
pub use store::{EntityStore, UpsertOutcome};
pub use timeline::{Anchor, Direction, TimelineWindow};
pub use types::{
    Chat, ChatId, ChatMeta, ConnectionState, EngineEvent, FileId, FileState, Intent,
    IntentOutcome, IntentTicket, LocalId, Message, MessageContent, MessageId, OutcomeDetail,
    RequestId, SendState, Update, User, UserId,
};
