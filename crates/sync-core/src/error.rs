use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{state_machine::ChatSyncState, types::RequestId};

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Malformed or unrecognized inbound event.
    Protocol,
    /// No response arrived before the request deadline.
    RequestTimeout,
    /// The backend rejected a request.
    RequestFailed,
    /// The backend asked the client to slow down.
    RateLimited,
    /// The backend requires (re)authorization.
    Auth,
    /// The channel to the backend process was lost.
    TransportLost,
    /// Client-side invariant break: double resolution, unknown chat, ...
    ProgrammingError,
    /// The action is not supported in the chat's current state.
    Config,
    /// A UI intent named something unknown or carried unusable input.
    Rejected,
}

/// Stable error payload carried in intent outcomes and defect reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Protocol, code, message)
    }

    pub fn timeout(id: RequestId, after: Duration) -> Self {
        Self::new(
            SyncErrorCategory::RequestTimeout,
            "request_timeout",
            format!("request {id} got no response within {} ms", after.as_millis()),
        )
    }

    /// Build an error from a backend `error` object (`code` + `message`).
    pub fn request_failed(backend_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut error = Self::new(
            classify_backend_code(backend_code),
            format!("backend_error_{backend_code}"),
            message.clone(),
        );
        if let Some(seconds) = parse_retry_after(&message) {
            error = error.with_retry_after(Duration::from_secs(seconds));
        }
        error
    }

    pub fn transport_lost(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::TransportLost, "transport_lost", message)
    }

    pub fn programming(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::ProgrammingError, code, message)
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Rejected, code, message)
    }

    /// Build a standard invalid-state error for an intent the chat cannot run now.
    pub fn invalid_state(current: ChatSyncState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Config,
            "invalid_state_transition",
            format!("cannot run '{action}' while chat is in state {current:?}"),
        )
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::RequestTimeout
                | SyncErrorCategory::RateLimited
                | SyncErrorCategory::TransportLost
        )
    }
}

/// Map backend numeric error codes (HTTP-like) to error categories.
pub fn classify_backend_code(code: i32) -> SyncErrorCategory {
    match code {
        401 => SyncErrorCategory::Auth,
        420 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::RequestFailed,
        500..=599 => SyncErrorCategory::TransportLost,
        _ => SyncErrorCategory::Protocol,
    }
}

/// Extract a flood-wait hint from messages like `Too Many Requests: retry after 17`
/// or `FLOOD_WAIT_17`.
fn parse_retry_after(message: &str) -> Option<u64> {
    let tail = message
        .find("retry after ")
        .map(|idx| &message[idx + "retry after ".len()..])
        .or_else(|| {
            message
                .find("FLOOD_WAIT_")
                .map(|idx| &message[idx + "FLOOD_WAIT_".len()..])
        })?;
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
