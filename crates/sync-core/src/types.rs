use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Backend chat identifier.
    ChatId(i64)
);
id_newtype!(
    /// Backend user identifier.
    UserId(i64)
);
id_newtype!(
    /// Backend file identifier.
    FileId(i32)
);
id_newtype!(
    /// Correlation id carried in `@extra` of every outgoing request.
    RequestId(u64)
);
id_newtype!(
    /// Temporary id of an optimistic send, unique for the engine's lifetime.
    LocalId(u64)
);
id_newtype!(
    /// Handle for one UI intent; echoed back in its outcome.
    IntentTicket(u64)
);

/// Message identity. Every remote id sorts before every local id, so pending
/// sends always sit at the newest end of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageId {
    Remote(i64),
    Local(LocalId),
}

impl MessageId {
    pub fn remote(self) -> Option<i64> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Local(_) => None,
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(id) => write!(f, "{id}"),
            Self::Local(local) => write!(f, "local-{local}"),
        }
    }
}

/// Chat list ordering key. Pinned chats first, then higher `order`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPosition {
    pub pinned: bool,
    pub order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    pub position: ChatPosition,
    pub unread_count: u32,
    pub last_read_inbox: Option<MessageId>,
    /// Weak reference; resolve through the store.
    pub last_message: Option<MessageId>,
    pub participants: Vec<UserId>,
    /// Store-local counter bumped on every real change.
    pub revision: u64,
}

impl Chat {
    pub fn new(id: ChatId) -> Self {
        Self {
            id,
            title: String::new(),
            position: ChatPosition::default(),
            unread_count: 0,
            last_read_inbox: None,
            last_message: None,
            participants: Vec::new(),
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendState {
    PendingLocal,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Animation,
    VoiceNote,
    VideoNote,
    Sticker,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Animation => "animation",
            Self::VoiceNote => "voice note",
            Self::VideoNote => "video note",
            Self::Sticker => "sticker",
        }
    }
}

/// Download state of a backend file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub id: FileId,
    pub expected_size: u64,
    pub downloaded_size: u64,
    pub local_path: Option<String>,
    /// The backend reports a running download.
    pub downloading: bool,
}

impl FileState {
    pub fn completed(&self) -> bool {
        self.expected_size > 0 && self.downloaded_size == self.expected_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        caption: Option<String>,
        /// Playback length in seconds, for audio and video kinds.
        duration: Option<u32>,
        /// Messages sent together as one album share this id.
        album_id: Option<i64>,
        /// File snapshot taken when the message was parsed. Live progress
        /// lives in the store's file registry.
        file: Option<FileState>,
    },
    Service {
        notice: String,
    },
    /// Tombstone. Keeps the timeline position of a deleted message.
    Deleted,
}

impl MessageContent {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// One-line rendering used for chat list previews and row bodies.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Media {
                kind,
                caption,
                duration,
                ..
            } => {
                let label = match duration {
                    Some(secs) => format!("{} {}:{:02}", kind.label(), secs / 60, secs % 60),
                    None => kind.label().to_owned(),
                };
                match caption.as_deref() {
                    Some(caption) if !caption.is_empty() => format!("[{label}] {caption}"),
                    _ => format!("[{label}]"),
                }
            }
            Self::Service { notice } => format!("* {notice}"),
            Self::Deleted => "message deleted".to_owned(),
        }
    }

    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Self::Media {
                file: Some(file), ..
            } => Some(file.id),
            _ => None,
        }
    }

    pub fn album_id(&self) -> Option<i64> {
        match self {
            Self::Media { album_id, .. } => *album_id,
            _ => None,
        }
    }

    /// Keep the album of `previous` when this content came from an edit,
    /// which carries no album id.
    pub fn inherit_album(&mut self, previous: &MessageContent) {
        if let Self::Media { album_id, .. } = self
            && album_id.is_none()
        {
            *album_id = previous.album_id();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// Weak reference into the user arena.
    pub sender: UserId,
    pub date: i64,
    pub content: MessageContent,
    /// Edit revision; never decreases for a given id.
    pub revision: u64,
    pub send_state: SendState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Online,
    Offline { last_seen: Option<i64> },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub presence: Presence,
    pub revision: u64,
}

/// Partial chat metadata carried by the chat-level update family. `None`
/// fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMeta {
    pub chat_id: ChatId,
    pub title: Option<String>,
    pub position: Option<ChatPosition>,
    pub unread_count: Option<u32>,
    pub last_read_inbox: Option<MessageId>,
    /// `Some(None)` clears the last message.
    pub last_message: Option<Option<MessageId>>,
    pub participants: Option<Vec<UserId>>,
}

impl ChatMeta {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub content: MessageContent,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPatch {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub presence: Option<Presence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
    AuthRequired,
    Authorized,
}

impl ConnectionState {
    /// States in which live delivery may have been interrupted.
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnected)
    }
}

/// Typed update produced by the normalizer. The engine consumes only these.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Full chat object. The backend announces each chat once.
    ChatAnnounced(ChatMeta),
    ChatMetaChanged(ChatMeta),
    MessageAdded(Message),
    /// A pending send reached the server. `old_id` is the temporary id the
    /// backend gave it; `message` carries the final one.
    MessageSendSucceeded {
        old_id: i64,
        message: Message,
    },
    MessageSendFailed {
        chat_id: ChatId,
        old_id: i64,
        error: SyncError,
    },
    MessageEdited(MessageEdit),
    MessageDeleted {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        /// Evicted from the backend cache only; not a real deletion.
        from_cache: bool,
    },
    ReadStateChanged {
        chat_id: ChatId,
        last_read_inbox: MessageId,
        unread_count: u32,
    },
    UserChanged(UserPatch),
    TypingChanged {
        chat_id: ChatId,
        user_id: UserId,
        typing: bool,
    },
    FileUpdated(FileState),
    ConnectionStateChanged(ConnectionState),
    RequestResult {
        id: RequestId,
        payload: Result<Value, SyncError>,
    },
}

/// Logical entity an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKey {
    Chat(ChatId),
    Message(ChatId, MessageId),
    User(UserId),
    File(FileId),
    Connection,
    Request(RequestId),
}

impl Update {
    pub fn key(&self) -> UpdateKey {
        match self {
            Self::ChatAnnounced(meta) | Self::ChatMetaChanged(meta) => {
                UpdateKey::Chat(meta.chat_id)
            }
            Self::MessageAdded(message) => UpdateKey::Message(message.chat_id, message.id),
            Self::MessageSendSucceeded { old_id, message } => {
                UpdateKey::Message(message.chat_id, MessageId::Remote(*old_id))
            }
            Self::MessageSendFailed {
                chat_id, old_id, ..
            } => UpdateKey::Message(*chat_id, MessageId::Remote(*old_id)),
            Self::MessageEdited(edit) => UpdateKey::Message(edit.chat_id, edit.message_id),
            Self::MessageDeleted { chat_id, .. }
            | Self::ReadStateChanged { chat_id, .. }
            | Self::TypingChanged { chat_id, .. } => UpdateKey::Chat(*chat_id),
            Self::UserChanged(patch) => UpdateKey::User(patch.user_id),
            Self::FileUpdated(file) => UpdateKey::File(file.id),
            Self::ConnectionStateChanged(_) => UpdateKey::Connection,
            Self::RequestResult { id, .. } => UpdateKey::Request(*id),
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        match self.key() {
            UpdateKey::Chat(chat_id) | UpdateKey::Message(chat_id, _) => Some(chat_id),
            _ => None,
        }
    }

    /// Live updates the ingress queue may shed under overflow. One-shot
    /// events are never dropped: request results, connection changes, chat
    /// announcements, full user objects and send confirmations.
    pub fn is_droppable(&self) -> bool {
        match self {
            Self::RequestResult { .. }
            | Self::ConnectionStateChanged(_)
            | Self::ChatAnnounced(_)
            | Self::MessageSendSucceeded { .. }
            | Self::MessageSendFailed { .. } => false,
            Self::UserChanged(patch) => patch.display_name.is_none(),
            _ => true,
        }
    }

    /// Whether losing this update leaves the timeline of its chat stale.
    pub fn affects_timeline(&self) -> bool {
        matches!(
            self,
            Self::MessageAdded(_) | Self::MessageEdited(_) | Self::MessageDeleted { .. }
        )
    }

    /// Whether losing this update leaves the chat list stale.
    pub fn affects_chat_list(&self) -> bool {
        matches!(
            self,
            Self::ChatAnnounced(_) | Self::ChatMetaChanged(_) | Self::ReadStateChanged { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatAnnounced(_) => "chat_announced",
            Self::ChatMetaChanged(_) => "chat_meta_changed",
            Self::MessageAdded(_) => "message_added",
            Self::MessageSendSucceeded { .. } => "message_send_succeeded",
            Self::MessageSendFailed { .. } => "message_send_failed",
            Self::MessageEdited(_) => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReadStateChanged { .. } => "read_state_changed",
            Self::UserChanged(_) => "user_changed",
            Self::TypingChanged { .. } => "typing_changed",
            Self::FileUpdated(_) => "file_updated",
            Self::ConnectionStateChanged(_) => "connection_state_changed",
            Self::RequestResult { .. } => "request_result",
        }
    }
}

/// User intents accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    OpenChat {
        chat_id: ChatId,
    },
    CloseChat {
        chat_id: ChatId,
    },
    LoadMoreHistory {
        chat_id: ChatId,
    },
    SendMessage {
        chat_id: ChatId,
        text: String,
    },
    RetryFailedSend {
        message_id: LocalId,
    },
    DismissFailedSend {
        message_id: LocalId,
    },
    MarkRead {
        chat_id: ChatId,
        message_id: MessageId,
    },
    EditMessage {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
    },
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        revoke: bool,
    },
    SelectMessage {
        chat_id: ChatId,
        message_id: Option<MessageId>,
    },
    DownloadFile {
        file_id: FileId,
    },
    CancelDownload {
        file_id: FileId,
    },
    /// Remove the downloaded copy of a file; the message stays.
    DeleteLocalFile {
        file_id: FileId,
    },
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenChat { .. } => "open_chat",
            Self::CloseChat { .. } => "close_chat",
            Self::LoadMoreHistory { .. } => "load_more_history",
            Self::SendMessage { .. } => "send_message",
            Self::RetryFailedSend { .. } => "retry_failed_send",
            Self::DismissFailedSend { .. } => "dismiss_failed_send",
            Self::MarkRead { .. } => "mark_read",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessages { .. } => "delete_messages",
            Self::SelectMessage { .. } => "select_message",
            Self::DownloadFile { .. } => "download_file",
            Self::CancelDownload { .. } => "cancel_download",
            Self::DeleteLocalFile { .. } => "delete_local_file",
        }
    }
}

/// The intent a request was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub ticket: IntentTicket,
    pub intent: &'static str,
}

/// Successful intent result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutcomeDetail {
    Done,
    /// The server confirmed the optimistic message under `assigned`.
    Sent {
        local_id: LocalId,
        assigned: MessageId,
    },
    HistoryLoaded {
        chat_id: ChatId,
        count: usize,
        has_more: bool,
    },
    /// The result arrived after the chat was closed and was not applied.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentOutcome {
    pub ticket: IntentTicket,
    pub intent: &'static str,
    pub result: Result<OutcomeDetail, SyncError>,
}

/// Events the engine reports next to view changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EngineEvent {
    Outcome(IntentOutcome),
    Defect(SyncError),
}
