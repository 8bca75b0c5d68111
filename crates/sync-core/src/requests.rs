//! Correlation of outgoing requests with their responses.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    error::SyncError,
    types::{ChatId, FileId, LocalId, MessageId, Origin, RequestId, UserId},
};

/// What an outgoing request was for. Decides its timeout and how the engine
/// applies the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    LoadChats,
    /// Newest page of a chat; initial backfill or resync.
    LatestPage { chat_id: ChatId },
    OlderPage { chat_id: ChatId, anchor: i64 },
    Send { chat_id: ChatId, local_id: LocalId },
    Edit { chat_id: ChatId, message_id: i64 },
    Delete { chat_id: ChatId, message_ids: Vec<i64> },
    MarkRead {
        chat_id: ChatId,
        message_id: MessageId,
        previous: Option<MessageId>,
    },
    Download { file_id: FileId, priority: u8 },
    CancelDownload { file_id: FileId },
    /// Remove the downloaded copy of a file.
    DeleteFile { file_id: FileId },
    /// Re-read a file whose updates were shed.
    FileRefresh { file_id: FileId },
    UserRefresh { user_id: UserId },
}

impl RequestKind {
    pub fn is_backfill(&self) -> bool {
        matches!(
            self,
            Self::LoadChats
                | Self::LatestPage { .. }
                | Self::OlderPage { .. }
                | Self::FileRefresh { .. }
                | Self::UserRefresh { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::LoadChats => "load_chats",
            Self::LatestPage { .. } => "latest_page",
            Self::OlderPage { .. } => "older_page",
            Self::Send { .. } => "send",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::MarkRead { .. } => "mark_read",
            Self::Download { .. } => "download",
            Self::CancelDownload { .. } => "cancel_download",
            Self::DeleteFile { .. } => "delete_file",
            Self::FileRefresh { .. } => "file_refresh",
            Self::UserRefresh { .. } => "user_refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Send, edit, delete, mark read and download control.
    pub interactive: Duration,
    /// History pages and the chat list.
    pub backfill: Duration,
}

impl RequestTimeouts {
    pub fn for_kind(&self, kind: &RequestKind) -> Duration {
        if kind.is_backfill() {
            self.backfill
        } else {
            self.interactive
        }
    }
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            interactive: Duration::from_secs(5),
            backfill: Duration::from_secs(15),
        }
    }
}

/// A request that reached its end: answered, rejected or timed out.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: RequestId,
    pub kind: RequestKind,
    pub origin: Option<Origin>,
    /// Cleared when the requester lost interest (chat closed).
    pub interested: bool,
    /// The response arrived after the request had already timed out.
    pub late: bool,
    pub outcome: Result<Value, SyncError>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    kind: RequestKind,
    origin: Option<Origin>,
    deadline: Instant,
    interested: bool,
}

#[derive(Debug, Clone)]
struct ExpiredRequest {
    id: RequestId,
    kind: RequestKind,
    origin: Option<Origin>,
}

/// Issues correlation ids and resolves each exactly once.
#[derive(Debug)]
pub struct RequestTracker {
    next_id: u64,
    pending: HashMap<RequestId, PendingRequest>,
    expired: VecDeque<ExpiredRequest>,
    expired_memory: usize,
    timeouts: RequestTimeouts,
}

impl RequestTracker {
    pub fn new(timeouts: RequestTimeouts, expired_memory: usize) -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            expired: VecDeque::new(),
            expired_memory,
            timeouts,
        }
    }

    pub fn submit(
        &mut self,
        kind: RequestKind,
        origin: Option<Origin>,
        now: Instant,
    ) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let deadline = now + self.timeouts.for_kind(&kind);
        trace!(request_id = %id, kind = kind.label(), "request submitted");
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                origin,
                deadline,
                interested: true,
            },
        );
        id
    }

    pub fn resolve(&mut self, id: RequestId, response: Value) -> Result<Completion, SyncError> {
        self.complete(id, Ok(response))
    }

    pub fn fail(&mut self, id: RequestId, reason: SyncError) -> Result<Completion, SyncError> {
        self.complete(id, Err(reason))
    }

    /// Time out every request whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Completion> {
        let mut due: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort();

        let mut completions = Vec::with_capacity(due.len());
        for id in due {
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            let timeout = self.timeouts.for_kind(&request.kind);
            debug!(request_id = %id, kind = request.kind.label(), "request timed out");
            self.remember_expired(ExpiredRequest {
                id,
                kind: request.kind.clone(),
                origin: request.origin,
            });
            completions.push(Completion {
                id,
                kind: request.kind,
                origin: request.origin,
                interested: request.interested,
                late: false,
                outcome: Err(SyncError::timeout(id, timeout)),
            });
        }
        completions
    }

    /// Mark a pending request as no longer wanted. Its result will still be
    /// consumed, but flagged.
    pub fn abandon(&mut self, id: RequestId) -> bool {
        self.set_interest(id, false)
    }

    pub fn reinterest(&mut self, id: RequestId) -> bool {
        self.set_interest(id, true)
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn set_interest(&mut self, id: RequestId, interested: bool) -> bool {
        match self.pending.get_mut(&id) {
            Some(request) => {
                request.interested = interested;
                true
            }
            None => false,
        }
    }

    fn complete(
        &mut self,
        id: RequestId,
        outcome: Result<Value, SyncError>,
    ) -> Result<Completion, SyncError> {
        if let Some(request) = self.pending.remove(&id) {
            return Ok(Completion {
                id,
                kind: request.kind,
                origin: request.origin,
                interested: request.interested,
                late: false,
                outcome,
            });
        }

        if let Some(position) = self.expired.iter().position(|expired| expired.id == id) {
            let expired = self.expired.remove(position).ok_or_else(|| {
                SyncError::programming("expired_ring", "expired entry vanished during removal")
            })?;
            debug!(request_id = %id, kind = expired.kind.label(), "late response after timeout");
            return Ok(Completion {
                id,
                kind: expired.kind,
                origin: expired.origin,
                interested: false,
                late: true,
                outcome,
            });
        }

        let code = if id.0 < self.next_id {
            "request_already_resolved"
        } else {
            "request_never_issued"
        };
        Err(SyncError::programming(
            code,
            format!("no pending request for correlation id {id}"),
        ))
    }

    fn remember_expired(&mut self, expired: ExpiredRequest) {
        if self.expired_memory == 0 {
            return;
        }
        while self.expired.len() >= self.expired_memory {
            self.expired.pop_front();
        }
        self.expired.push_back(expired);
    }
}

/// Builders for outgoing backend requests. Each carries its correlation id
/// in `@extra`.
pub mod wire {
    use serde_json::{Value, json};

    use crate::types::{ChatId, FileId, RequestId, UserId};

    pub fn load_chats(id: RequestId, limit: usize) -> Value {
        json!({
            "@type": "loadChats",
            "chat_list": {"@type": "chatListMain"},
            "limit": limit,
            "@extra": id.0,
        })
    }

    /// `from_message_id` of 0 asks for the newest messages.
    pub fn get_chat_history(
        id: RequestId,
        chat_id: ChatId,
        from_message_id: Option<i64>,
        limit: usize,
    ) -> Value {
        json!({
            "@type": "getChatHistory",
            "chat_id": chat_id.0,
            "from_message_id": from_message_id.unwrap_or(0),
            "offset": 0,
            "limit": limit,
            "only_local": false,
            "@extra": id.0,
        })
    }

    pub fn send_text(id: RequestId, chat_id: ChatId, text: &str) -> Value {
        json!({
            "@type": "sendMessage",
            "chat_id": chat_id.0,
            "input_message_content": {
                "@type": "inputMessageText",
                "text": {"@type": "formattedText", "text": text},
            },
            "@extra": id.0,
        })
    }

    pub fn edit_text(id: RequestId, chat_id: ChatId, message_id: i64, text: &str) -> Value {
        json!({
            "@type": "editMessageText",
            "chat_id": chat_id.0,
            "message_id": message_id,
            "input_message_content": {
                "@type": "inputMessageText",
                "text": {"@type": "formattedText", "text": text},
            },
            "@extra": id.0,
        })
    }

    pub fn delete_messages(id: RequestId, chat_id: ChatId, message_ids: &[i64], revoke: bool) -> Value {
        json!({
            "@type": "deleteMessages",
            "chat_id": chat_id.0,
            "message_ids": message_ids,
            "revoke": revoke,
            "@extra": id.0,
        })
    }

    pub fn view_messages(id: RequestId, chat_id: ChatId, message_ids: &[i64]) -> Value {
        json!({
            "@type": "viewMessages",
            "chat_id": chat_id.0,
            "message_ids": message_ids,
            "force_read": true,
            "@extra": id.0,
        })
    }

    pub fn download_file(id: RequestId, file_id: FileId, priority: u8) -> Value {
        json!({
            "@type": "downloadFile",
            "file_id": file_id.0,
            "priority": priority,
            "offset": 0,
            "limit": 0,
            "synchronous": false,
            "@extra": id.0,
        })
    }

    pub fn cancel_download(id: RequestId, file_id: FileId) -> Value {
        json!({
            "@type": "cancelDownloadFile",
            "file_id": file_id.0,
            "only_if_pending": false,
            "@extra": id.0,
        })
    }

    /// Deletes the local copy only; the message keeps its attachment.
    pub fn delete_file(id: RequestId, file_id: FileId) -> Value {
        json!({"@type": "deleteFile", "file_id": file_id.0, "@extra": id.0})
    }

    pub fn get_file(id: RequestId, file_id: FileId) -> Value {
        json!({"@type": "getFile", "file_id": file_id.0, "@extra": id.0})
    }

    pub fn get_user(id: RequestId, user_id: UserId) -> Value {
        json!({"@type": "getUser", "user_id": user_id.0, "@extra": id.0})
    }
}
