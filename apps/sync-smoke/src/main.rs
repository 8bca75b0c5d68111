//! Drives the sync runtime against a scripted in-memory backend and prints
//! the final projection.

use std::{io, process::ExitCode, time::Duration};

use serde_json::{Value, json};
use sync_core::{ChatId, EngineEvent, IntentOutcome, IntentTicket, MessageId, UserId};
use sync_runtime::{
    BackendPeer, RuntimeError, SyncHandle, SyncRuntimeConfig, channel_transport, spawn_runtime,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CHAT: i64 = 100;
const HISTORY_LEN: i64 = 10;
const WAIT: Duration = Duration::from_secs(5);
/// Temporary ids of unconfirmed sends start here.
const TEMPORARY_ID_BASE: i64 = 1 << 20;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let mut config = SyncRuntimeConfig::default();
    config.engine.page_size = 5;
    config.engine.own_user_id = UserId(1);
    config.tick_interval = Duration::from_millis(50);

    let (sink, source, peer) = channel_transport();
    let handle = spawn_runtime(config, sink, source);
    tokio::spawn(scripted_backend(peer));

    let result = drive(&handle).await;
    handle.shutdown();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(reason) => {
            eprintln!("sync smoke failed: {reason}");
            ExitCode::FAILURE
        }
    }
}

async fn drive(handle: &SyncHandle) -> Result<(), String> {
    let mut events = handle.subscribe();
    let mut snapshots = handle.watch();

    timeout(
        WAIT,
        snapshots.wait_for(|snapshot| snapshot.chats.iter().any(|row| row.chat_id == ChatId(CHAT))),
    )
    .await
    .map_err(|_| "chat list never arrived".to_owned())?
    .map_err(|_| "runtime stopped".to_owned())?;

    let chat_id = ChatId(CHAT);
    let steps: [(&str, fn(&SyncHandle) -> Result<IntentTicket, RuntimeError>); 4] = [
        ("open chat", |h| h.open_chat(ChatId(CHAT))),
        ("load older history", |h| h.load_more_history(ChatId(CHAT))),
        ("send message", |h| h.send_message(ChatId(CHAT), "hello from smoke")),
        ("mark read", |h| {
            h.mark_read(ChatId(CHAT), MessageId::Remote(HISTORY_LEN + 1))
        }),
    ];
    for (label, submit) in steps {
        let ticket = submit(handle).map_err(|err| format!("{label}: {err}"))?;
        let outcome = await_outcome(&mut events, ticket).await?;
        match &outcome.result {
            Ok(detail) => info!(step = label, ?detail, "step finished"),
            Err(err) => return Err(format!("{label}: {err}")),
        }
    }

    let snapshot = handle.snapshot();
    let rows = snapshot.timelines.get(&chat_id).map_or(0, Vec::len);
    info!(rows, version = snapshot.version, "final projection");
    let rendered = serde_json::to_string_pretty(&*snapshot).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(())
}

async fn await_outcome(
    events: &mut sync_runtime::EventStream,
    ticket: IntentTicket,
) -> Result<IntentOutcome, String> {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .map_err(|_| format!("no outcome for ticket {ticket}"))?
            .map_err(|err| err.to_string())?;
        match event {
            EngineEvent::Outcome(outcome) if outcome.ticket == ticket => return Ok(outcome),
            EngineEvent::Outcome(_) => {}
            EngineEvent::Defect(defect) => warn!(error = %defect, "engine defect"),
        }
    }
}

/// Answers requests the way a real backend would for one chat with a short
/// history.
async fn scripted_backend(mut peer: BackendPeer) {
    let announcements = [
        json!({"@type": "updateConnectionState", "state": {"@type": "connectionStateReady"}}),
        json!({"@type": "updateUser", "user": {"id": 2, "first_name": "Ada", "last_name": "Lovelace"}}),
        json!({
            "@type": "updateNewChat",
            "chat": {
                "id": CHAT,
                "title": "smoke",
                "type": {"@type": "chatTypePrivate", "user_id": 2},
                "positions": [{"list": {"@type": "chatListMain"}, "order": 5}],
                "last_message": {"id": HISTORY_LEN},
                "unread_count": 2,
            },
        }),
    ];
    for event in announcements {
        if peer.emit(event).is_err() {
            return;
        }
    }

    let mut next_id = HISTORY_LEN;
    while let Some(request) = peer.next_request().await {
        let kind = request["@type"].as_str().unwrap_or_default().to_owned();
        debug!(%kind, "scripted backend request");
        let mut confirmation = None;
        let response = match kind.as_str() {
            "loadChats" => json!({"@type": "error", "code": 404, "message": "Not Found"}),
            "getChatHistory" => history_page(&request),
            "sendMessage" => {
                next_id += 1;
                let text = request["input_message_content"]["text"]["text"].clone();
                let temporary = TEMPORARY_ID_BASE + next_id;
                confirmation = Some(json!({
                    "@type": "updateMessageSendSucceeded",
                    "old_message_id": temporary,
                    "message": message(next_id, 1, text.clone()),
                }));
                let mut pending = message(temporary, 1, text);
                pending["sending_state"] = json!({"@type": "messageSendingStatePending"});
                pending
            }
            "viewMessages" => json!({"@type": "ok"}),
            other => {
                json!({"@type": "error", "code": 400, "message": format!("{other} not scripted")})
            }
        };
        if peer.reply(&request, response).is_err() {
            break;
        }
        if let Some(update) = confirmation
            && peer.emit(update).is_err()
        {
            break;
        }
    }
}

fn history_page(request: &Value) -> Value {
    let from = request["from_message_id"].as_i64().unwrap_or(0);
    let limit = request["limit"].as_i64().unwrap_or(1);
    let newest = if from == 0 { HISTORY_LEN } else { from - 1 };
    let messages: Vec<Value> = (1..=newest)
        .rev()
        .take(usize::try_from(limit).unwrap_or(0))
        .map(|id| message(id, 2, json!(format!("message {id}"))))
        .collect();
    json!({"@type": "messages", "total_count": messages.len(), "messages": messages})
}

fn message(id: i64, sender: i64, text: Value) -> Value {
    json!({
        "@type": "message",
        "id": id,
        "chat_id": CHAT,
        "sender_id": {"@type": "messageSenderUser", "user_id": sender},
        "date": 1_700_000_000 + id,
        "content": {"@type": "messageText", "text": {"@type": "formattedText", "text": text}},
    })
}
