//! Bounded queue between the receive loop and the engine actor.

use std::collections::{BTreeSet, VecDeque};

use tracing::warn;

use crate::types::{ChatId, FileId, Intent, IntentTicket, Update, UserId};

/// One unit of work for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    Update(Update),
    Intent { ticket: IntentTicket, intent: Intent },
}

/// What was shed since the last drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overflow {
    /// Chats whose timeline lost live updates.
    pub chats: BTreeSet<ChatId>,
    /// Chat metadata or read state was lost.
    pub chat_list_lost: bool,
    /// Files whose progress updates were shed.
    pub files: BTreeSet<FileId>,
    /// Users whose presence updates were shed.
    pub users: BTreeSet<UserId>,
    pub dropped: u64,
}

impl Overflow {
    pub fn is_empty(&self) -> bool {
        self.dropped == 0
    }
}

#[derive(Debug, Default)]
pub struct Drained {
    pub inputs: Vec<EngineInput>,
    pub overflow: Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The oldest live update was shed to make room.
    DroppedOldest,
    /// Nothing sheddable was queued; the queue grew past its bound.
    OverCapacity,
}

/// FIFO with a soft bound. On overflow the oldest droppable live update is
/// shed and recorded; request results, connection changes and intents are
/// never dropped.
#[derive(Debug)]
pub struct IngressQueue {
    items: VecDeque<EngineInput>,
    capacity: usize,
    overflow: Overflow,
}

impl IngressQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            overflow: Overflow::default(),
        }
    }

    pub fn push(&mut self, input: EngineInput) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        if self.items.len() >= self.capacity {
            outcome = if self.shed_oldest() {
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::OverCapacity
            };
        }
        self.items.push_back(input);
        outcome
    }

    pub fn drain(&mut self) -> Drained {
        Drained {
            inputs: self.items.drain(..).collect(),
            overflow: std::mem::take(&mut self.overflow),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn shed_oldest(&mut self) -> bool {
        let Some(position) = self.items.iter().position(|input| match input {
            EngineInput::Update(update) => update.is_droppable(),
            EngineInput::Intent { .. } => false,
        }) else {
            return false;
        };
        let Some(EngineInput::Update(update)) = self.items.remove(position) else {
            return false;
        };

        self.overflow.dropped += 1;
        if update.affects_timeline()
            && let Some(chat_id) = update.chat_id()
        {
            self.overflow.chats.insert(chat_id);
        }
        if update.affects_chat_list() {
            self.overflow.chat_list_lost = true;
        }
        match &update {
            Update::FileUpdated(file) => {
                self.overflow.files.insert(file.id);
            }
            Update::UserChanged(patch) => {
                self.overflow.users.insert(patch.user_id);
            }
            _ => {}
        }
        warn!(
            kind = update.kind(),
            chat_id = ?update.chat_id(),
            dropped = self.overflow.dropped,
            "ingress queue full; dropped oldest live update"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::types::{
        ChatMeta, ConnectionState, FileState, Message, MessageContent, MessageId, RequestId,
        SendState,
    };

    fn deleted(chat: i64) -> EngineInput {
        EngineInput::Update(Update::MessageDeleted {
            chat_id: ChatId(chat),
            message_ids: vec![MessageId::Remote(1)],
            from_cache: false,
        })
    }

    fn result(id: u64) -> EngineInput {
        EngineInput::Update(Update::RequestResult {
            id: RequestId(id),
            payload: Ok(Value::Null),
        })
    }

    #[test]
    fn overflow_sheds_oldest_live_update_and_records_chat() {
        let mut queue = IngressQueue::new(3);
        assert_eq!(queue.push(result(1)), PushOutcome::Queued);
        assert_eq!(queue.push(deleted(7)), PushOutcome::Queued);
        assert_eq!(queue.push(deleted(8)), PushOutcome::Queued);
        assert_eq!(queue.push(result(2)), PushOutcome::DroppedOldest);

        let drained = queue.drain();
        assert_eq!(drained.inputs, vec![result(1), deleted(8), result(2)]);
        assert_eq!(drained.overflow.dropped, 1);
        assert_eq!(drained.overflow.chats, BTreeSet::from([ChatId(7)]));
        assert!(!drained.overflow.chat_list_lost);
        assert!(queue.is_empty());
        assert!(queue.drain().overflow.is_empty());
    }

    #[test]
    fn never_drops_results_connection_changes_or_intents() {
        let mut queue = IngressQueue::new(2);
        queue.push(result(1));
        queue.push(EngineInput::Update(Update::ConnectionStateChanged(
            ConnectionState::Connected,
        )));
        let outcome = queue.push(EngineInput::Intent {
            ticket: IntentTicket(1),
            intent: Intent::OpenChat { chat_id: ChatId(3) },
        });
        assert_eq!(outcome, PushOutcome::OverCapacity);
        assert_eq!(queue.len(), 3);
        assert!(queue.drain().overflow.is_empty());
    }

    #[test]
    fn chat_announcement_is_kept_when_a_message_arrives_at_capacity() {
        let mut queue = IngressQueue::new(1);
        let announced = EngineInput::Update(Update::ChatAnnounced(ChatMeta::new(ChatId(4))));
        let added = EngineInput::Update(Update::MessageAdded(Message {
            id: MessageId::Remote(9),
            chat_id: ChatId(4),
            sender: UserId(2),
            date: 0,
            content: MessageContent::Text {
                text: "hi".to_owned(),
            },
            revision: 0,
            send_state: SendState::Sent,
        }));
        queue.push(announced.clone());
        assert_eq!(queue.push(added.clone()), PushOutcome::OverCapacity);

        let drained = queue.drain();
        assert_eq!(drained.inputs, vec![announced, added]);
        assert!(drained.overflow.is_empty());
    }

    #[test]
    fn shed_file_progress_is_recorded_for_refresh() {
        let mut queue = IngressQueue::new(1);
        queue.push(EngineInput::Update(Update::FileUpdated(FileState {
            id: FileId(12),
            expected_size: 100,
            downloaded_size: 40,
            local_path: None,
            downloading: true,
        })));
        assert_eq!(queue.push(result(1)), PushOutcome::DroppedOldest);

        let overflow = queue.drain().overflow;
        assert_eq!(overflow.files, BTreeSet::from([FileId(12)]));
        assert!(overflow.chats.is_empty());
        assert!(!overflow.chat_list_lost);
    }
}
