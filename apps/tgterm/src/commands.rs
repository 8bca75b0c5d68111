//! Line commands read from stdin.
//!
//! ```text
//! open 42 | close 42 | more 42 | send 42 hello there
//! read 42 1007 | edit 42 1007 new text | delete 42 [--revoke] 1007 1008
//! select 42 1007 | select 42 none | retry local-3 | dismiss local-3
//! download 9 | cancel 9 | rmfile 9 | quit
//! ```

use std::num::ParseIntError;

use sync_core::{ChatId, FileId, Intent, LocalId, MessageId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Intent(Intent),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{command}` expects {expected}")]
    Usage {
        command: &'static str,
        expected: &'static str,
    },
    #[error("invalid {what} `{value}`: {source}")]
    InvalidId {
        what: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let intent = match verb {
        "quit" | "exit" => return Ok(Some(Command::Quit)),
        "open" => Intent::OpenChat {
            chat_id: chat_arg(args.next(), "open", "<chat>")?,
        },
        "close" => Intent::CloseChat {
            chat_id: chat_arg(args.next(), "close", "<chat>")?,
        },
        "more" => Intent::LoadMoreHistory {
            chat_id: chat_arg(args.next(), "more", "<chat>")?,
        },
        "send" => {
            let (chat, text) = split_first(rest);
            let chat_id = chat_arg(chat, "send", "<chat> <text>")?;
            if text.is_empty() {
                return Err(usage("send", "<chat> <text>"));
            }
            Intent::SendMessage {
                chat_id,
                text: text.to_owned(),
            }
        }
        "read" => Intent::MarkRead {
            chat_id: chat_arg(args.next(), "read", "<chat> <message>")?,
            message_id: message_arg(args.next(), "read", "<chat> <message>")?,
        },
        "edit" => {
            const EXPECTED: &str = "<chat> <message> <text>";
            let (chat, rest) = split_first(rest);
            let (message, text) = split_first(rest);
            let chat_id = chat_arg(chat, "edit", EXPECTED)?;
            let message_id = message_arg(message, "edit", EXPECTED)?;
            if text.is_empty() {
                return Err(usage("edit", EXPECTED));
            }
            Intent::EditMessage {
                chat_id,
                message_id,
                text: text.to_owned(),
            }
        }
        "delete" => {
            const EXPECTED: &str = "<chat> [--revoke] <message>...";
            let chat_id = chat_arg(args.next(), "delete", EXPECTED)?;
            let mut revoke = false;
            let mut message_ids = Vec::new();
            for arg in args {
                if arg == "--revoke" {
                    revoke = true;
                } else {
                    message_ids.push(parse_message_id(arg)?);
                }
            }
            if message_ids.is_empty() {
                return Err(usage("delete", EXPECTED));
            }
            Intent::DeleteMessages {
                chat_id,
                message_ids,
                revoke,
            }
        }
        "select" => {
            const EXPECTED: &str = "<chat> <message|none>";
            let chat_id = chat_arg(args.next(), "select", EXPECTED)?;
            let message_id = match args.next() {
                Some("none") => None,
                Some(arg) => Some(parse_message_id(arg)?),
                None => return Err(usage("select", EXPECTED)),
            };
            Intent::SelectMessage {
                chat_id,
                message_id,
            }
        }
        "retry" => Intent::RetryFailedSend {
            message_id: local_arg(args.next(), "retry")?,
        },
        "dismiss" => Intent::DismissFailedSend {
            message_id: local_arg(args.next(), "dismiss")?,
        },
        "download" => Intent::DownloadFile {
            file_id: file_arg(args.next(), "download")?,
        },
        "cancel" => Intent::CancelDownload {
            file_id: file_arg(args.next(), "cancel")?,
        },
        "rmfile" => Intent::DeleteLocalFile {
            file_id: file_arg(args.next(), "rmfile")?,
        },
        other => return Err(CommandError::Unknown(other.to_owned())),
    };
    Ok(Some(Command::Intent(intent)))
}

fn usage(command: &'static str, expected: &'static str) -> CommandError {
    CommandError::Usage { command, expected }
}

fn split_first(input: &str) -> (Option<&str>, &str) {
    let input = input.trim_start();
    if input.is_empty() {
        return (None, "");
    }
    match input.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first), rest.trim()),
        None => (Some(input), ""),
    }
}

fn parse_int<T>(what: &'static str, value: &str) -> Result<T, CommandError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    value.parse().map_err(|source| CommandError::InvalidId {
        what,
        value: value.to_owned(),
        source,
    })
}

fn chat_arg(
    arg: Option<&str>,
    command: &'static str,
    expected: &'static str,
) -> Result<ChatId, CommandError> {
    let arg = arg.ok_or(usage(command, expected))?;
    parse_int("chat id", arg).map(ChatId)
}

fn message_arg(
    arg: Option<&str>,
    command: &'static str,
    expected: &'static str,
) -> Result<MessageId, CommandError> {
    parse_message_id(arg.ok_or(usage(command, expected))?)
}

/// `1007` is a remote id, `local-3` a pending send.
fn parse_message_id(arg: &str) -> Result<MessageId, CommandError> {
    match arg.strip_prefix("local-") {
        Some(local) => parse_int("local id", local).map(|id| MessageId::Local(LocalId(id))),
        None => parse_int("message id", arg).map(MessageId::Remote),
    }
}

fn local_arg(arg: Option<&str>, command: &'static str) -> Result<LocalId, CommandError> {
    let arg = arg.ok_or(usage(command, "<local-id>"))?;
    parse_int("local id", arg.strip_prefix("local-").unwrap_or(arg)).map(LocalId)
}

fn file_arg(arg: Option<&str>, command: &'static str) -> Result<FileId, CommandError> {
    let arg = arg.ok_or(usage(command, "<file>"))?;
    parse_int("file id", arg).map(FileId)
}
