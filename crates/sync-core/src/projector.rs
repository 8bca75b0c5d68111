//! Render-ready rows derived from the engine on demand.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    engine::Engine,
    state_machine::ChatSyncState,
    timeline::{Anchor, Direction},
    types::{
        Chat, ChatId, ConnectionState, Message, MessageContent, MessageId, Presence, SendState,
        UserId,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRow {
    pub chat_id: ChatId,
    pub title: String,
    pub pinned: bool,
    pub unread_count: u32,
    pub preview: String,
    /// Display names of users currently typing.
    pub typing: Vec<String>,
    /// Private chat whose peer is online.
    pub peer_online: bool,
    pub sync_state: ChatSyncState,
    pub is_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowKind {
    Text,
    Media,
    Service,
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub expected: u64,
    pub local_path: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub kind: RowKind,
    pub edited: bool,
    pub send_state: SendState,
    /// History is missing between the previous row and this one.
    pub gap_before: bool,
    pub is_selected: bool,
    pub download: Option<DownloadProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub connection: ConnectionState,
    pub syncing_chats: usize,
    pub pending_requests: usize,
    pub last_error: Option<String>,
}

/// Immutable unit handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSnapshot {
    pub version: u64,
    pub chats: Vec<ChatRow>,
    /// Timelines of open chats.
    pub timelines: BTreeMap<ChatId, Vec<MessageRow>>,
    pub status: StatusLine,
}

/// Read-only view over an [`Engine`]. Cost is proportional to the rows
/// produced, never to the stored history.
pub struct ViewProjector<'a> {
    engine: &'a Engine,
}

impl<'a> ViewProjector<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub fn project_chat_list(&self, limit: usize) -> Vec<ChatRow> {
        self.engine
            .store()
            .reorder_chats()
            .take(limit)
            .map(|chat| self.chat_row(chat))
            .collect()
    }

    /// Newest `limit` rows of the chat's window, oldest first.
    pub fn project_timeline(&self, chat_id: ChatId, limit: usize) -> Vec<MessageRow> {
        let store = self.engine.store();
        let Some(window) = store.window(chat_id) else {
            return Vec::new();
        };
        let mut messages: Vec<&Message> = store
            .timeline_window(chat_id, Anchor::Newest, Direction::Backward, limit)
            .collect();
        messages.reverse();

        let selection = self.engine.selection(chat_id);
        let mut previous = None;
        messages
            .into_iter()
            .map(|message| {
                let gap_before = window.gap_between(previous, message.id);
                if let Some(id) = message.id.remote() {
                    previous = Some(id);
                }
                self.message_row(message, gap_before, selection == Some(message.id))
            })
            .collect()
    }

    pub fn status_line(&self) -> StatusLine {
        StatusLine {
            connection: self.engine.connection(),
            syncing_chats: self.engine.syncing_chats(),
            pending_requests: self.engine.pending_requests(),
            last_error: self.engine.last_error().map(ToString::to_string),
        }
    }

    pub fn snapshot(&self, version: u64) -> ViewSnapshot {
        let config = self.engine.config();
        let timelines = self
            .engine
            .open_chats()
            .map(|chat_id| (chat_id, self.project_timeline(chat_id, config.timeline_rows)))
            .collect();
        ViewSnapshot {
            version,
            chats: self.project_chat_list(config.chat_rows),
            timelines,
            status: self.status_line(),
        }
    }

    fn chat_row(&self, chat: &Chat) -> ChatRow {
        let store = self.engine.store();
        let preview = chat
            .last_message
            .and_then(|id| store.message(chat.id, id))
            .map(|message| message.content.preview())
            .unwrap_or_default();
        let peer_online = match chat.participants.as_slice() {
            [peer] => store
                .users()
                .get(*peer)
                .is_some_and(|user| user.presence == Presence::Online),
            _ => false,
        };
        ChatRow {
            chat_id: chat.id,
            title: chat.title.clone(),
            pinned: chat.position.pinned,
            unread_count: chat.unread_count,
            preview,
            typing: self
                .engine
                .typing_users(chat.id)
                .map(|user_id| self.display_name(user_id))
                .collect(),
            peer_online,
            sync_state: self.engine.chat_state(chat.id),
            is_open: self.engine.is_open(chat.id),
        }
    }

    fn message_row(&self, message: &Message, gap_before: bool, is_selected: bool) -> MessageRow {
        let kind = match &message.content {
            MessageContent::Text { .. } => RowKind::Text,
            MessageContent::Media { .. } => RowKind::Media,
            MessageContent::Service { .. } => RowKind::Service,
            MessageContent::Deleted => RowKind::Tombstone,
        };
        let download = message.content.file_id().and_then(|file_id| {
            self.engine
                .store()
                .file(file_id)
                .map(|file| DownloadProgress {
                    downloaded: file.downloaded_size,
                    expected: file.expected_size,
                    local_path: file.local_path.clone(),
                    active: file.downloading || self.engine.download_priority(file_id).is_some(),
                })
        });
        MessageRow {
            id: message.id,
            sender_id: message.sender,
            sender_name: self.display_name(message.sender),
            body: message.content.preview(),
            kind,
            edited: message.revision > 0 && kind != RowKind::Tombstone,
            send_state: message.send_state,
            gap_before,
            is_selected,
            download,
        }
    }

    fn display_name(&self, user_id: UserId) -> String {
        self.engine
            .store()
            .users()
            .get(user_id)
            .map(|user| user.display_name.clone())
            .unwrap_or_else(|| format!("user {user_id}"))
    }
}
