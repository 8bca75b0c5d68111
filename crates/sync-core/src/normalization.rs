//! Raw backend events to typed [`Update`]s.
//!
//! The wire format is tdlib-style JSON: every object names its shape in
//! `@type`, and responses to requests echo the correlation id in `@extra`.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::{
    error::SyncError,
    types::{
        ChatId, ChatMeta, ChatPosition, ConnectionState, FileId, FileState, MediaKind, Message,
        MessageContent, MessageEdit, MessageId, Presence, RequestId, SendState, Update, UserId,
        UserPatch,
    },
};

/// Result of normalizing one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Update(Update),
    Unrecognized {
        discriminant: Option<String>,
        reason: String,
    },
}

impl Normalized {
    pub fn into_update(self) -> Option<Update> {
        match self {
            Self::Update(update) => Some(update),
            Self::Unrecognized { .. } => None,
        }
    }
}

/// Shape mismatch inside an event whose `@type` is known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("field '{0}' has an unexpected type")]
    WrongType(&'static str),
    #[error("field '{0}' is out of range")]
    OutOfRange(&'static str),
    #[error("unsupported content type '{0}'")]
    UnsupportedContent(String),
}

impl From<ShapeError> for SyncError {
    fn from(err: ShapeError) -> Self {
        SyncError::protocol("malformed_event", err.to_string())
    }
}

/// Map one raw event to a typed update. Never fails; malformed input comes
/// back as [`Normalized::Unrecognized`].
pub fn normalize(raw: &Value) -> Normalized {
    let Some(object) = raw.as_object() else {
        return unrecognized(None, "event is not a JSON object");
    };

    if let Some(extra) = object.get("@extra") {
        return match parse_request_id(extra) {
            Some(id) => Normalized::Update(Update::RequestResult {
                id,
                payload: response_payload(object),
            }),
            None => unrecognized(
                object.get("@type").and_then(Value::as_str),
                "@extra is not a correlation id",
            ),
        };
    }

    let Some(kind) = object.get("@type").and_then(Value::as_str) else {
        return unrecognized(None, "missing @type discriminant");
    };

    match classify(kind, raw) {
        Ok(Some(update)) => Normalized::Update(update),
        Ok(None) => unrecognized(Some(kind), "unsupported event type"),
        Err(err) => unrecognized(Some(kind), err.to_string()),
    }
}

/// [`normalize`], logging and discarding unrecognized input.
pub fn normalize_logged(raw: &Value) -> Option<Update> {
    match normalize(raw) {
        Normalized::Update(update) => Some(update),
        Normalized::Unrecognized {
            discriminant,
            reason,
        } => {
            warn!(discriminant = ?discriminant, %reason, "dropping unrecognized backend event");
            None
        }
    }
}

fn unrecognized(discriminant: Option<&str>, reason: impl Into<String>) -> Normalized {
    Normalized::Unrecognized {
        discriminant: discriminant.map(str::to_owned),
        reason: reason.into(),
    }
}

fn classify(kind: &str, raw: &Value) -> Result<Option<Update>, ShapeError> {
    let update = match kind {
        "updateNewChat" => Update::ChatAnnounced(chat_from_value(field(raw, "chat")?)?),
        "updateChatTitle" => {
            let mut meta = ChatMeta::new(ChatId(i64_field(raw, "chat_id")?));
            meta.title = Some(str_field(raw, "title")?.to_owned());
            Update::ChatMetaChanged(meta)
        }
        "updateChatPosition" => {
            let mut meta = ChatMeta::new(ChatId(i64_field(raw, "chat_id")?));
            meta.position = Some(position_from_value(field(raw, "position")?)?);
            Update::ChatMetaChanged(meta)
        }
        "updateChatLastMessage" => {
            let mut meta = ChatMeta::new(ChatId(i64_field(raw, "chat_id")?));
            meta.last_message = Some(match raw.get("last_message") {
                Some(Value::Null) | None => None,
                Some(message) => Some(MessageId::Remote(i64_field(message, "id")?)),
            });
            meta.position = main_list_position(raw)?;
            Update::ChatMetaChanged(meta)
        }
        "updateNewMessage" => Update::MessageAdded(message_from_value(field(raw, "message")?)?),
        "updateMessageContent" => {
            let chat_id = ChatId(i64_field(raw, "chat_id")?);
            let message_id = MessageId::Remote(i64_field(raw, "message_id")?);
            let revision = opt_i64_field(raw, "edit_revision")?
                .or(opt_i64_field(raw, "edit_date")?)
                .ok_or(ShapeError::Missing("edit_date"))?;
            Update::MessageEdited(MessageEdit {
                chat_id,
                message_id,
                content: content_from_value(field(raw, "new_content")?)?,
                revision: non_negative(revision),
            })
        }
        "updateMessageSendSucceeded" => Update::MessageSendSucceeded {
            old_id: i64_field(raw, "old_message_id")?,
            message: message_from_value(field(raw, "message")?)?,
        },
        "updateMessageSendFailed" => {
            let message = field(raw, "message")?;
            let (code, text) = match raw.get("error") {
                Some(error) if !error.is_null() => {
                    (opt_i64_field(error, "code")?, opt_str_field(error, "message")?)
                }
                _ => (
                    opt_i64_field(raw, "error_code")?,
                    opt_str_field(raw, "error_message")?,
                ),
            };
            // A failure without a code is a plain rejection.
            let code = code.and_then(|code| i32::try_from(code).ok()).unwrap_or(400);
            Update::MessageSendFailed {
                chat_id: ChatId(i64_field(message, "chat_id")?),
                old_id: i64_field(raw, "old_message_id")?,
                error: SyncError::request_failed(
                    code,
                    text.unwrap_or_else(|| "message could not be sent".to_owned()),
                ),
            }
        }
        "updateDeleteMessages" => Update::MessageDeleted {
            chat_id: ChatId(i64_field(raw, "chat_id")?),
            message_ids: array_field(raw, "message_ids")?
                .iter()
                .map(|id| as_i64(id, "message_ids").map(MessageId::Remote))
                .collect::<Result<_, _>>()?,
            from_cache: opt_bool_field(raw, "from_cache")?.unwrap_or(false),
        },
        "updateChatReadInbox" => Update::ReadStateChanged {
            chat_id: ChatId(i64_field(raw, "chat_id")?),
            last_read_inbox: MessageId::Remote(i64_field(raw, "last_read_inbox_message_id")?),
            unread_count: u32_field(raw, "unread_count")?,
        },
        "updateUser" => Update::UserChanged(user_from_value(field(raw, "user")?)?),
        "updateUserStatus" => Update::UserChanged(UserPatch {
            user_id: UserId(i64_field(raw, "user_id")?),
            display_name: None,
            presence: Some(presence_from_value(field(raw, "status")?)?),
        }),
        "updateChatAction" => {
            let action = field(raw, "action")?;
            Update::TypingChanged {
                chat_id: ChatId(i64_field(raw, "chat_id")?),
                user_id: sender_from_value(field(raw, "sender_id")?)?,
                typing: type_of(action)? != "chatActionCancel",
            }
        }
        "updateFile" => Update::FileUpdated(file_from_value(field(raw, "file")?)?),
        "updateConnectionState" => {
            let state = match type_of(field(raw, "state")?)? {
                "connectionStateReady" | "connectionStateUpdating" => ConnectionState::Connected,
                "connectionStateConnecting" | "connectionStateConnectingToProxy" => {
                    ConnectionState::Connecting
                }
                "connectionStateWaitingForNetwork" => ConnectionState::Disconnected,
                _ => return Err(ShapeError::WrongType("state")),
            };
            Update::ConnectionStateChanged(state)
        }
        "updateAuthorizationState" => {
            let state = match type_of(field(raw, "authorization_state")?)? {
                "authorizationStateReady" => ConnectionState::Authorized,
                "authorizationStateClosed"
                | "authorizationStateClosing"
                | "authorizationStateLoggingOut" => ConnectionState::Disconnected,
                other if other.starts_with("authorizationStateWait") => {
                    ConnectionState::AuthRequired
                }
                _ => return Err(ShapeError::WrongType("authorization_state")),
            };
            Update::ConnectionStateChanged(state)
        }
        _ => return Ok(None),
    };
    Ok(Some(update))
}

/// Parse a full `message` object, as found in `updateNewMessage` and in the
/// responses to `sendMessage`, `editMessageText` and history pages.
///
/// A message still waiting for the server (`messageSendingStatePending`)
/// comes back as [`SendState::PendingLocal`] under its temporary id.
pub fn message_from_value(value: &Value) -> Result<Message, ShapeError> {
    let send_state = match value.get("sending_state") {
        Some(state) if !state.is_null() => match type_of(state)? {
            "messageSendingStatePending" => SendState::PendingLocal,
            "messageSendingStateFailed" => SendState::Failed,
            _ => SendState::Sent,
        },
        _ => SendState::Sent,
    };
    let revision = match opt_i64_field(value, "edit_revision")? {
        Some(revision) => revision,
        None => opt_i64_field(value, "edit_date")?.unwrap_or(0),
    };
    let mut content = content_from_value(field(value, "content")?)?;
    if let MessageContent::Media { album_id, .. } = &mut content {
        // "0" means the message is not part of an album.
        *album_id = opt_i64_field(value, "media_album_id")?.filter(|id| *id != 0);
    }
    Ok(Message {
        id: MessageId::Remote(i64_field(value, "id")?),
        chat_id: ChatId(i64_field(value, "chat_id")?),
        sender: sender_from_value(field(value, "sender_id")?)?,
        date: opt_i64_field(value, "date")?.unwrap_or(0),
        content,
        revision: non_negative(revision),
        send_state,
    })
}

/// Parse a `messages` page response. Malformed entries are skipped.
pub fn page_from_value(value: &Value) -> Result<Vec<Message>, ShapeError> {
    let mut messages = Vec::new();
    for entry in array_field(value, "messages")? {
        if entry.is_null() {
            continue;
        }
        match message_from_value(entry) {
            Ok(message) => messages.push(message),
            Err(err) => warn!(error = %err, "skipping malformed message in history page"),
        }
    }
    Ok(messages)
}

pub fn file_from_value(value: &Value) -> Result<FileState, ShapeError> {
    let local = value.get("local");
    let (downloaded_size, downloading) = match local {
        Some(local) => (
            opt_i64_field(local, "downloaded_size")?.unwrap_or(0),
            opt_bool_field(local, "is_downloading_active")?.unwrap_or(false),
        ),
        None => (0, false),
    };
    let local_path = local
        .and_then(|local| local.get("path"))
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(str::to_owned);
    let expected_size = match opt_i64_field(value, "size")? {
        Some(size) if size > 0 => size,
        _ => opt_i64_field(value, "expected_size")?.unwrap_or(0),
    };
    Ok(FileState {
        id: FileId(i32_field(value, "id")?),
        expected_size: non_negative(expected_size),
        downloaded_size: non_negative(downloaded_size),
        local_path,
        downloading,
    })
}

fn chat_from_value(chat: &Value) -> Result<ChatMeta, ShapeError> {
    let mut meta = ChatMeta::new(ChatId(i64_field(chat, "id")?));
    meta.title = Some(str_field(chat, "title")?.to_owned());
    meta.position = Some(main_list_position(chat)?.unwrap_or_default());
    meta.unread_count = opt_i64_field(chat, "unread_count")?
        .map(|count| u32::try_from(count.max(0)).unwrap_or(u32::MAX));
    meta.last_read_inbox = opt_i64_field(chat, "last_read_inbox_message_id")?
        .filter(|id| *id > 0)
        .map(MessageId::Remote);
    meta.last_message = Some(match chat.get("last_message") {
        Some(Value::Null) | None => None,
        Some(message) => Some(MessageId::Remote(i64_field(message, "id")?)),
    });
    if let Some(kind) = chat.get("type")
        && type_of(kind)? == "chatTypePrivate"
    {
        meta.participants = Some(vec![UserId(i64_field(kind, "user_id")?)]);
    }
    Ok(meta)
}

/// Position of the chat in the main list, from either a `positions` array or
/// a single `position` object.
fn main_list_position(raw: &Value) -> Result<Option<ChatPosition>, ShapeError> {
    if let Some(positions) = raw.get("positions").and_then(Value::as_array) {
        for position in positions {
            let list = field(position, "list")?;
            if type_of(list)? == "chatListMain" {
                return position_from_value(position).map(Some);
            }
        }
        return positions.first().map(position_from_value).transpose();
    }
    match raw.get("position") {
        Some(position) if !position.is_null() => position_from_value(position).map(Some),
        _ => Ok(None),
    }
}

fn position_from_value(position: &Value) -> Result<ChatPosition, ShapeError> {
    Ok(ChatPosition {
        pinned: opt_bool_field(position, "is_pinned")?.unwrap_or(false),
        order: i64_field(position, "order")?,
    })
}

/// Parse a full `user` object, as found in `updateUser` and `getUser`.
pub fn user_from_value(user: &Value) -> Result<UserPatch, ShapeError> {
    let id = i64_field(user, "id")?;
    let first = opt_str_field(user, "first_name")?.unwrap_or_default();
    let last = opt_str_field(user, "last_name")?.unwrap_or_default();
    let mut display_name = format!("{first} {last}").trim().to_owned();
    if display_name.is_empty() {
        display_name = user
            .get("usernames")
            .and_then(|names| names.get("active_usernames"))
            .and_then(Value::as_array)
            .and_then(|names| names.first())
            .and_then(Value::as_str)
            .map(|name| format!("@{name}"))
            .unwrap_or_else(|| format!("user {id}"));
    }
    let presence = match user.get("status") {
        Some(status) if !status.is_null() => Some(presence_from_value(status)?),
        _ => None,
    };
    Ok(UserPatch {
        user_id: UserId(id),
        display_name: Some(display_name),
        presence,
    })
}

fn presence_from_value(status: &Value) -> Result<Presence, ShapeError> {
    Ok(match type_of(status)? {
        "userStatusOnline" => Presence::Online,
        "userStatusOffline" => Presence::Offline {
            last_seen: opt_i64_field(status, "was_online")?,
        },
        "userStatusRecently" | "userStatusLastWeek" | "userStatusLastMonth" => {
            Presence::Offline { last_seen: None }
        }
        _ => Presence::Unknown,
    })
}

fn sender_from_value(sender: &Value) -> Result<UserId, ShapeError> {
    match type_of(sender)? {
        "messageSenderUser" => Ok(UserId(i64_field(sender, "user_id")?)),
        // Channel posts are attributed to the chat itself.
        "messageSenderChat" => Ok(UserId(i64_field(sender, "chat_id")?)),
        _ => Err(ShapeError::WrongType("sender_id")),
    }
}

fn content_from_value(content: &Value) -> Result<MessageContent, ShapeError> {
    let kind = type_of(content)?;
    let (media, file_key) = match kind {
        "messageText" => {
            return Ok(MessageContent::Text {
                text: formatted_text(field(content, "text")?)?,
            });
        }
        "messagePhoto" => (MediaKind::Photo, None),
        "messageVideo" => (MediaKind::Video, Some(("video", "video"))),
        "messageDocument" => (MediaKind::Document, Some(("document", "document"))),
        "messageAudio" => (MediaKind::Audio, Some(("audio", "audio"))),
        "messageAnimation" => (MediaKind::Animation, Some(("animation", "animation"))),
        "messageVoiceNote" => (MediaKind::VoiceNote, Some(("voice_note", "voice"))),
        "messageVideoNote" => (MediaKind::VideoNote, Some(("video_note", "video"))),
        "messageSticker" => (MediaKind::Sticker, Some(("sticker", "sticker"))),
        other if other.starts_with("message") => {
            return Ok(MessageContent::Service {
                notice: humanize_content_type(other),
            });
        }
        other => return Err(ShapeError::UnsupportedContent(other.to_owned())),
    };

    let file = match file_key {
        Some((outer, inner)) => content
            .get(outer)
            .and_then(|media| media.get(inner))
            .map(file_from_value)
            .transpose()?,
        // Photos carry several sizes; the largest one is last.
        None => content
            .get("photo")
            .and_then(|photo| photo.get("sizes"))
            .and_then(Value::as_array)
            .and_then(|sizes| sizes.last())
            .and_then(|size| size.get("photo"))
            .map(file_from_value)
            .transpose()?,
    };
    let caption = match content.get("caption") {
        Some(caption) if !caption.is_null() => Some(formatted_text(caption)?),
        _ => None,
    }
    .filter(|caption| !caption.is_empty());
    let duration = match file_key.and_then(|(outer, _)| content.get(outer)) {
        Some(media) => opt_u32_field(media, "duration")?,
        None => None,
    };

    Ok(MessageContent::Media {
        kind: media,
        caption,
        duration,
        album_id: None,
        file,
    })
}

fn formatted_text(value: &Value) -> Result<String, ShapeError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        other => Ok(str_field(other, "text")?.to_owned()),
    }
}

/// `messageChatAddMembers` -> `chat add members`.
fn humanize_content_type(kind: &str) -> String {
    let body = kind.strip_prefix("message").unwrap_or(kind);
    let mut out = String::with_capacity(body.len() + 4);
    for ch in body.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn response_payload(object: &Map<String, Value>) -> Result<Value, SyncError> {
    if object.get("@type").and_then(Value::as_str) == Some("error") {
        let code = object
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or_default();
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("backend error");
        return Err(SyncError::request_failed(code, message));
    }
    let mut payload = object.clone();
    payload.remove("@extra");
    Ok(Value::Object(payload))
}

fn parse_request_id(extra: &Value) -> Option<RequestId> {
    match extra {
        Value::Number(number) => number.as_u64().map(RequestId),
        Value::String(text) => text.trim().parse().ok().map(RequestId),
        _ => None,
    }
}

fn field<'a>(value: &'a Value, key: &'static str) -> Result<&'a Value, ShapeError> {
    match value.get(key) {
        Some(Value::Null) | None => Err(ShapeError::Missing(key)),
        Some(found) => Ok(found),
    }
}

fn type_of(value: &Value) -> Result<&str, ShapeError> {
    field(value, "@type")?
        .as_str()
        .ok_or(ShapeError::WrongType("@type"))
}

/// 64-bit integers travel either as numbers or as decimal strings.
fn as_i64(value: &Value, key: &'static str) -> Result<i64, ShapeError> {
    match value {
        Value::Number(number) => number.as_i64().ok_or(ShapeError::WrongType(key)),
        Value::String(text) => text.parse().map_err(|_| ShapeError::WrongType(key)),
        _ => Err(ShapeError::WrongType(key)),
    }
}

fn i64_field(value: &Value, key: &'static str) -> Result<i64, ShapeError> {
    as_i64(field(value, key)?, key)
}

fn opt_i64_field(value: &Value, key: &'static str) -> Result<Option<i64>, ShapeError> {
    match value.get(key) {
        Some(Value::Null) | None => Ok(None),
        Some(found) => as_i64(found, key).map(Some),
    }
}

fn i32_field(value: &Value, key: &'static str) -> Result<i32, ShapeError> {
    i32::try_from(i64_field(value, key)?).map_err(|_| ShapeError::OutOfRange(key))
}

fn u32_field(value: &Value, key: &'static str) -> Result<u32, ShapeError> {
    u32::try_from(i64_field(value, key)?).map_err(|_| ShapeError::OutOfRange(key))
}

fn opt_u32_field(value: &Value, key: &'static str) -> Result<Option<u32>, ShapeError> {
    opt_i64_field(value, key)?
        .map(|found| u32::try_from(found).map_err(|_| ShapeError::OutOfRange(key)))
        .transpose()
}

/// Sizes and revisions below zero are treated as zero.
fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn str_field<'a>(value: &'a Value, key: &'static str) -> Result<&'a str, ShapeError> {
    field(value, key)?
        .as_str()
        .ok_or(ShapeError::WrongType(key))
}

fn opt_str_field(value: &Value, key: &'static str) -> Result<Option<String>, ShapeError> {
    match value.get(key) {
        Some(Value::Null) | None => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ShapeError::WrongType(key)),
    }
}

fn opt_bool_field(value: &Value, key: &'static str) -> Result<Option<bool>, ShapeError> {
    match value.get(key) {
        Some(Value::Null) | None => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(_) => Err(ShapeError::WrongType(key)),
    }
}

fn array_field<'a>(value: &'a Value, key: &'static str) -> Result<&'a Vec<Value>, ShapeError> {
    field(value, key)?
        .as_array()
        .ok_or(ShapeError::WrongType(key))
}
