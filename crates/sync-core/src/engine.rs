//! The synchronization engine: the only writer of the [`EntityStore`].
//!
//! Each call consumes one input (a typed update, an intent, a tick) and
//! returns a [`Step`] with the outgoing wire requests, the parts of the view
//! that changed, and intent outcomes. The engine never performs I/O.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::EngineConfig,
    downloads::DownloadSlots,
    error::SyncError,
    ingress::{EngineInput, Overflow},
    normalization::{file_from_value, message_from_value, page_from_value, user_from_value},
    requests::{Completion, RequestKind, RequestTracker, wire},
    retry::RetrySchedule,
    state_machine::{ChatStateMachine, ChatSyncState},
    store::EntityStore,
    timeline::{LiveBuffer, PageSpan, TimelineWindow},
    types::{
        ChatId, ChatMeta, ConnectionState, EngineEvent, FileId, FileState, Intent,
        IntentOutcome, IntentTicket, LocalId, Message, MessageContent, MessageEdit, MessageId,
        Origin, OutcomeDetail, RequestId, SendState, Update, UserId,
    },
};

/// Part of the view model invalidated by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Change {
    ChatList,
    Timeline(ChatId),
    Status,
}

/// Everything one engine call produced.
#[derive(Debug, Default)]
pub struct Step {
    /// Outgoing wire requests, in submission order.
    pub requests: Vec<Value>,
    pub changes: BTreeSet<Change>,
    pub events: Vec<EngineEvent>,
}

impl Step {
    pub fn merge(&mut self, other: Step) {
        self.requests.extend(other.requests);
        self.changes.extend(other.changes);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.changes.is_empty() && self.events.is_empty()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &IntentOutcome> {
        self.events.iter().filter_map(|event| match event {
            EngineEvent::Outcome(outcome) => Some(outcome),
            EngineEvent::Defect(_) => None,
        })
    }

    fn change(&mut self, change: Change) {
        self.changes.insert(change);
    }

    fn report(&mut self, origin: Option<Origin>, result: Result<OutcomeDetail, SyncError>) {
        if let Some(origin) = origin {
            self.events.push(EngineEvent::Outcome(IntentOutcome {
                ticket: origin.ticket,
                intent: origin.intent,
                result,
            }));
        }
    }
}

/// Immediate intent result: `Some` reports now, `None` waits for the request.
type IntentResult = Result<Option<OutcomeDetail>, SyncError>;

/// A send the backend accepted under a temporary id.
#[derive(Debug, Clone, Copy)]
struct AwaitingConfirmation {
    local_id: LocalId,
    /// `None` once the intent has already been answered by a timeout.
    origin: Option<Origin>,
}

#[derive(Debug, Default)]
struct ChatSync {
    machine: ChatStateMachine,
    open: bool,
    buffer: LiveBuffer,
    latest_request: Option<RequestId>,
    older_request: Option<RequestId>,
    gap_refetches: u32,
    /// The in-flight latest page predates a known loss; fetch again after it.
    stale_page: bool,
    retry: RetrySchedule,
    selection: Option<MessageId>,
}

pub struct Engine {
    config: EngineConfig,
    store: EntityStore,
    tracker: RequestTracker,
    chats: HashMap<ChatId, ChatSync>,
    connection: ConnectionState,
    delivery_interrupted: bool,
    chat_list_request: Option<RequestId>,
    chats_before_load: usize,
    next_local_id: u64,
    local_index: HashMap<LocalId, ChatId>,
    awaiting_confirmation: HashMap<(ChatId, i64), AwaitingConfirmation>,
    /// Set after the chat list was shed; cleared once it has been reloaded.
    tolerate_unannounced: bool,
    downloads: DownloadSlots,
    typing: HashMap<ChatId, BTreeMap<UserId, Instant>>,
    last_error: Option<SyncError>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            store: EntityStore::new(config.orphan_cap),
            tracker: RequestTracker::new(config.timeouts, config.expired_memory),
            chats: HashMap::new(),
            connection: ConnectionState::Connecting,
            delivery_interrupted: false,
            chat_list_request: None,
            chats_before_load: 0,
            next_local_id: 0,
            local_index: HashMap::new(),
            awaiting_confirmation: HashMap::new(),
            tolerate_unannounced: false,
            downloads: DownloadSlots::default(),
            typing: HashMap::new(),
            last_error: None,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn chat_state(&self, chat_id: ChatId) -> ChatSyncState {
        self.chats
            .get(&chat_id)
            .map_or(ChatSyncState::Uninitialized, |sync| sync.machine.state())
    }

    pub fn is_open(&self, chat_id: ChatId) -> bool {
        self.chats.get(&chat_id).is_some_and(|sync| sync.open)
    }

    pub fn open_chats(&self) -> impl Iterator<Item = ChatId> + '_ {
        self.chats
            .iter()
            .filter(|(_, sync)| sync.open)
            .map(|(chat_id, _)| *chat_id)
    }

    pub fn selection(&self, chat_id: ChatId) -> Option<MessageId> {
        self.chats.get(&chat_id).and_then(|sync| sync.selection)
    }

    pub fn typing_users(&self, chat_id: ChatId) -> impl Iterator<Item = UserId> + '_ {
        self.typing
            .get(&chat_id)
            .into_iter()
            .flat_map(|users| users.keys().copied())
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Chats waiting for a backfill or resync page.
    pub fn syncing_chats(&self) -> usize {
        self.chats
            .values()
            .filter(|sync| sync.machine.buffers_live_updates())
            .count()
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn download_priority(&self, file_id: FileId) -> Option<u8> {
        self.downloads.priority_of(file_id)
    }

    /// Initial requests after the transport comes up.
    pub fn start(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        info!("sync engine starting");
        self.request_chat_list(now, &mut step);
        step
    }

    pub fn handle(&mut self, input: EngineInput, now: Instant) -> Step {
        match input {
            EngineInput::Update(update) => self.apply_update(update, now),
            EngineInput::Intent { ticket, intent } => self.apply_intent(ticket, intent, now),
        }
    }

    pub fn apply_update(&mut self, update: Update, now: Instant) -> Step {
        let mut step = Step::default();
        trace!(kind = update.kind(), key = ?update.key(), "applying update");
        match update {
            Update::ChatAnnounced(meta) | Update::ChatMetaChanged(meta) => {
                self.on_chat_meta(meta, now, &mut step)
            }
            Update::MessageAdded(message) => self.on_message_added(message, &mut step),
            Update::MessageSendSucceeded { old_id, message } => {
                self.on_send_succeeded(old_id, message, &mut step)
            }
            Update::MessageSendFailed {
                chat_id,
                old_id,
                error,
            } => self.on_send_failed(chat_id, old_id, error, &mut step),
            Update::MessageEdited(edit) => self.on_message_edited(edit, &mut step),
            Update::MessageDeleted {
                chat_id,
                message_ids,
                from_cache,
            } => self.on_messages_deleted(chat_id, message_ids, from_cache, &mut step),
            Update::ReadStateChanged {
                chat_id,
                last_read_inbox,
                unread_count,
            } => {
                if self
                    .store
                    .set_read_state(chat_id, last_read_inbox, unread_count)
                {
                    step.change(Change::ChatList);
                }
            }
            Update::UserChanged(patch) => {
                if self.store.upsert_user(&patch) {
                    step.change(Change::ChatList);
                    self.touch_open_timelines(&mut step);
                }
            }
            Update::TypingChanged {
                chat_id,
                user_id,
                typing,
            } => self.on_typing(chat_id, user_id, typing, now, &mut step),
            Update::FileUpdated(file) => self.on_file(file, &mut step),
            Update::ConnectionStateChanged(state) => self.on_connection(state, now, &mut step),
            Update::RequestResult { id, payload } => {
                let completion = match payload {
                    Ok(response) => self.tracker.resolve(id, response),
                    Err(reason) => self.tracker.fail(id, reason),
                };
                match completion {
                    Ok(completion) => self.complete(completion, now, &mut step),
                    Err(defect) => self.defect(defect, &mut step),
                }
            }
        }
        step
    }

    pub fn apply_intent(&mut self, ticket: IntentTicket, intent: Intent, now: Instant) -> Step {
        let mut step = Step::default();
        let origin = Origin {
            ticket,
            intent: intent.kind(),
        };
        debug!(%ticket, intent = intent.kind(), "applying intent");

        let result = match intent {
            Intent::OpenChat { chat_id } => self.open_chat(chat_id, origin, now, &mut step),
            Intent::CloseChat { chat_id } => self.close_chat(chat_id, &mut step),
            Intent::LoadMoreHistory { chat_id } => {
                self.load_more_history(chat_id, origin, now, &mut step)
            }
            Intent::SendMessage { chat_id, text } => {
                self.send_message(chat_id, &text, origin, now, &mut step)
            }
            Intent::RetryFailedSend { message_id } => {
                self.retry_failed_send(message_id, origin, now, &mut step)
            }
            Intent::DismissFailedSend { message_id } => {
                self.dismiss_failed_send(message_id, &mut step)
            }
            Intent::MarkRead {
                chat_id,
                message_id,
            } => self.mark_read(chat_id, message_id, origin, now, &mut step),
            Intent::EditMessage {
                chat_id,
                message_id,
                text,
            } => self.edit_message(chat_id, message_id, &text, origin, now, &mut step),
            Intent::DeleteMessages {
                chat_id,
                message_ids,
                revoke,
            } => self.delete_messages(chat_id, &message_ids, revoke, origin, now, &mut step),
            Intent::SelectMessage {
                chat_id,
                message_id,
            } => self.select_message(chat_id, message_id, &mut step),
            Intent::DownloadFile { file_id } => self.download_file(file_id, origin, now, &mut step),
            Intent::CancelDownload { file_id } => {
                self.cancel_download(file_id, origin, now, &mut step)
            }
            Intent::DeleteLocalFile { file_id } => {
                self.delete_local_file(file_id, origin, now, &mut step)
            }
        };

        match result {
            Ok(Some(detail)) => step.report(Some(origin), Ok(detail)),
            Ok(None) => {}
            Err(err) => {
                debug!(%ticket, intent = origin.intent, error = %err, "intent rejected");
                step.report(Some(origin), Err(err.clone()));
                self.note_error(err, &mut step);
            }
        }
        step
    }

    /// Recover from updates the ingress queue had to shed.
    pub fn apply_overflow(&mut self, overflow: &Overflow, now: Instant) -> Step {
        let mut step = Step::default();
        if overflow.is_empty() {
            return step;
        }
        warn!(
            dropped = overflow.dropped,
            chats = overflow.chats.len(),
            chat_list_lost = overflow.chat_list_lost,
            files = overflow.files.len(),
            users = overflow.users.len(),
            "recovering from ingress overflow"
        );
        if overflow.chat_list_lost {
            self.tolerate_unannounced = true;
            self.request_chat_list(now, &mut step);
        }
        for chat_id in &overflow.chats {
            self.begin_resync(*chat_id, now, &mut step);
        }
        for &file_id in &overflow.files {
            self.submit(RequestKind::FileRefresh { file_id }, None, now, &mut step, |id| {
                wire::get_file(id, file_id)
            });
        }
        for &user_id in &overflow.users {
            self.submit(RequestKind::UserRefresh { user_id }, None, now, &mut step, |id| {
                wire::get_user(id, user_id)
            });
        }
        step
    }

    /// Expire requests, fire due resync retries and prune typing indicators.
    pub fn tick(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        for completion in self.tracker.expire(now) {
            self.complete(completion, now, &mut step);
        }

        if !self.delivery_interrupted {
            let due: Vec<ChatId> = self
                .chats
                .iter_mut()
                .filter(|(_, sync)| {
                    sync.open
                        && sync.latest_request.is_none()
                        && sync.machine.buffers_live_updates()
                })
                .filter_map(|(chat_id, sync)| sync.retry.take_due(now).then_some(*chat_id))
                .collect();
            for chat_id in due {
                debug!(%chat_id, "retrying history page");
                self.request_latest_page(chat_id, None, now, &mut step);
            }
        }

        let mut pruned = false;
        self.typing.retain(|_, users| {
            let before = users.len();
            users.retain(|_, expires_at| *expires_at > now);
            pruned |= users.len() != before;
            !users.is_empty()
        });
        if pruned {
            step.change(Change::ChatList);
        }
        step
    }

    fn on_chat_meta(&mut self, meta: ChatMeta, now: Instant, step: &mut Step) {
        let chat_id = meta.chat_id;
        let moved_last = matches!(meta.last_message, Some(Some(_)));
        if self.store.upsert_chat(&meta).changed {
            step.change(Change::ChatList);
        }
        if moved_last && self.chat_state(chat_id) == ChatSyncState::Live && self.has_gap(chat_id) {
            warn!(%chat_id, "last message moved past the window; resyncing");
            self.begin_resync(chat_id, now, step);
        }
    }

    fn on_message_added(&mut self, message: Message, step: &mut Step) {
        let chat_id = message.chat_id;
        if !self.ensure_known_chat(chat_id, "message_added", step) {
            return;
        }
        // Our own sends show under their local id until confirmed.
        if message.send_state == SendState::PendingLocal {
            trace!(%chat_id, message_id = %message.id, "ignoring unconfirmed send");
            return;
        }
        let sync = self.chats.entry(chat_id).or_default();
        if sync.machine.buffers_live_updates() {
            trace!(%chat_id, message_id = %message.id, "buffering live message");
            sync.buffer.push_added(message);
            return;
        }

        let live = sync.machine.state() == ChatSyncState::Live;
        let id = message.id;
        let changed = self.store.upsert_message(message).changed();
        let extended = live
            && id
                .remote()
                .is_some_and(|remote| self.store.window_mut(chat_id).extend_newest(remote));
        if live && (changed || extended) {
            step.change(Change::Timeline(chat_id));
        }
        if changed && self.is_last_message(chat_id, id) {
            step.change(Change::ChatList);
        }
    }

    fn on_send_succeeded(&mut self, old_id: i64, message: Message, step: &mut Step) {
        let chat_id = message.chat_id;
        if !self.ensure_known_chat(chat_id, "message_send_succeeded", step) {
            return;
        }
        if self
            .store
            .remove_message(chat_id, MessageId::Remote(old_id))
            .is_some()
        {
            step.change(Change::Timeline(chat_id));
        }
        let Some(awaiting) = self.awaiting_confirmation.remove(&(chat_id, old_id)) else {
            debug!(%chat_id, old_id, "confirmation for a send this session did not track");
            self.on_message_added(message, step);
            return;
        };
        let local_id = awaiting.local_id;
        let assigned = message.id;
        self.remap(chat_id, local_id, message, step);
        if awaiting.origin.is_none() {
            info!(%chat_id, %local_id, %assigned, "late send confirmation applied");
        }
        step.report(awaiting.origin, Ok(OutcomeDetail::Sent { local_id, assigned }));
    }

    fn on_send_failed(
        &mut self,
        chat_id: ChatId,
        old_id: i64,
        error: SyncError,
        step: &mut Step,
    ) {
        if self
            .store
            .remove_message(chat_id, MessageId::Remote(old_id))
            .is_some()
        {
            step.change(Change::Timeline(chat_id));
        }
        let Some(awaiting) = self.awaiting_confirmation.remove(&(chat_id, old_id)) else {
            debug!(%chat_id, old_id, error = %error, "untracked send failed");
            return;
        };
        let local = MessageId::Local(awaiting.local_id);
        if self.store.set_send_state(chat_id, local, SendState::Failed) {
            step.change(Change::Timeline(chat_id));
        }
        warn!(%chat_id, %local, error = %error, "server rejected send");
        self.finish(awaiting.origin, Err(error), step);
    }

    fn on_message_edited(&mut self, edit: MessageEdit, step: &mut Step) {
        let chat_id = edit.chat_id;
        if !self.ensure_known_chat(chat_id, "message_edited", step) {
            return;
        }
        let sync = self.chats.entry(chat_id).or_default();
        if sync.machine.buffers_live_updates() {
            sync.buffer.push_edit(edit);
            return;
        }
        let id = edit.message_id;
        let outcome = self.store.apply_edit(&edit);
        trace!(%chat_id, message_id = %id, ?outcome, "edit applied");
        if outcome.changed() {
            self.touch_message(chat_id, id, step);
        }
    }

    fn on_messages_deleted(
        &mut self,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        from_cache: bool,
        step: &mut Step,
    ) {
        if from_cache {
            trace!(%chat_id, count = message_ids.len(), "ignoring cache eviction");
            return;
        }
        if !self.ensure_known_chat(chat_id, "message_deleted", step) {
            return;
        }
        let sync = self.chats.entry(chat_id).or_default();
        if sync.machine.buffers_live_updates() {
            for id in message_ids {
                sync.buffer.push_delete(id);
            }
            return;
        }
        for id in message_ids {
            if self.store.tombstone(chat_id, id).changed() {
                self.touch_message(chat_id, id, step);
            }
        }
    }

    fn on_typing(
        &mut self,
        chat_id: ChatId,
        user_id: UserId,
        typing: bool,
        now: Instant,
        step: &mut Step,
    ) {
        let changed = if typing {
            self.typing
                .entry(chat_id)
                .or_default()
                .insert(user_id, now + self.config.typing_ttl)
                .is_none()
        } else {
            self.typing
                .get_mut(&chat_id)
                .is_some_and(|users| users.remove(&user_id).is_some())
        };
        if changed {
            step.change(Change::ChatList);
        }
    }

    /// Apply a file update. The download slot is freed once the file is
    /// complete or the backend stops a running download.
    fn on_file(&mut self, file: FileState, step: &mut Step) {
        let file_id = file.id;
        let completed = file.completed();
        let stopped = !file.downloading
            && self
                .store
                .file(file_id)
                .is_some_and(|known| known.downloading);
        if self.store.upsert_file(file) {
            self.touch_open_timelines(step);
        }
        if (completed || stopped) && let Some(priority) = self.downloads.release(file_id) {
            debug!(%file_id, priority, completed, "download finished; slot released");
        }
    }

    fn on_connection(&mut self, state: ConnectionState, now: Instant, step: &mut Step) {
        if self.connection == state {
            return;
        }
        let previous = std::mem::replace(&mut self.connection, state);
        debug!(?previous, ?state, "connection state changed");
        step.change(Change::Status);

        if state.is_interrupted() {
            if self.delivery_interrupted {
                return;
            }
            self.delivery_interrupted = true;
            let mut idle_closed = Vec::new();
            for (chat_id, sync) in &mut self.chats {
                if sync.machine.interrupt().is_none() {
                    continue;
                }
                debug!(%chat_id, "live delivery interrupted; chat resyncing");
                sync.retry.cancel();
                step.change(Change::Timeline(*chat_id));
                if sync.latest_request.is_some() {
                    sync.stale_page = true;
                } else if !sync.open {
                    idle_closed.push(*chat_id);
                }
            }
            for chat_id in idle_closed {
                self.reset_chat(chat_id);
            }
        } else if state == ConnectionState::Connected && self.delivery_interrupted {
            self.delivery_interrupted = false;
            info!("connection restored; resyncing open chats");
            self.request_chat_list(now, step);
            let resync: Vec<ChatId> = self
                .chats
                .iter()
                .filter(|(_, sync)| {
                    sync.open
                        && sync.machine.state() == ChatSyncState::Resyncing
                        && sync.latest_request.is_none()
                })
                .map(|(chat_id, _)| *chat_id)
                .collect();
            for chat_id in resync {
                self.request_latest_page(chat_id, None, now, step);
            }
        }
    }

    fn complete(&mut self, completion: Completion, now: Instant, step: &mut Step) {
        trace!(
            request_id = %completion.id,
            kind = completion.kind.label(),
            late = completion.late,
            "request completed"
        );
        step.change(Change::Status);
        if completion.late && !matches!(completion.kind, RequestKind::Send { .. }) {
            debug!(request_id = %completion.id, kind = completion.kind.label(), "discarding late response");
            return;
        }

        match completion.kind.clone() {
            RequestKind::LoadChats => self.complete_chat_list(completion, now, step),
            RequestKind::LatestPage { chat_id } => {
                self.complete_latest_page(chat_id, completion, now, step)
            }
            RequestKind::OlderPage { chat_id, anchor } => {
                self.complete_older_page(chat_id, anchor, completion, step)
            }
            RequestKind::Send { chat_id, local_id } => {
                self.complete_send(chat_id, local_id, completion, step)
            }
            RequestKind::Edit { chat_id, .. } => {
                let result = completion.outcome.and_then(|response| {
                    let message = message_from_value(&response).map_err(SyncError::from)?;
                    let id = message.id;
                    if self.store.upsert_message(message).changed() {
                        self.touch_message(chat_id, id, step);
                    }
                    Ok(OutcomeDetail::Done)
                });
                self.finish(completion.origin, result, step);
            }
            RequestKind::Delete {
                chat_id,
                message_ids,
            } => {
                let result = completion.outcome.map(|_| {
                    for id in message_ids {
                        let id = MessageId::Remote(id);
                        if self.store.tombstone(chat_id, id).changed() {
                            self.touch_message(chat_id, id, step);
                        }
                    }
                    OutcomeDetail::Done
                });
                self.finish(completion.origin, result, step);
            }
            RequestKind::MarkRead {
                chat_id,
                message_id,
                previous,
            } => {
                if completion.outcome.is_err()
                    && self
                        .store
                        .restore_read_marker(chat_id, message_id, previous)
                {
                    debug!(%chat_id, %message_id, "mark read failed; marker restored");
                    step.change(Change::ChatList);
                }
                let result = completion.outcome.map(|_| OutcomeDetail::Done);
                self.finish(completion.origin, result, step);
            }
            RequestKind::Download { file_id, .. } => {
                let result = match completion.outcome {
                    Ok(response) => {
                        if let Ok(file) = file_from_value(&response) {
                            self.on_file(file, step);
                        }
                        Ok(OutcomeDetail::Done)
                    }
                    Err(err) => {
                        self.downloads.release(file_id);
                        Err(err)
                    }
                };
                self.finish(completion.origin, result, step);
            }
            RequestKind::CancelDownload { .. } => {
                let result = completion.outcome.map(|_| OutcomeDetail::Done);
                self.finish(completion.origin, result, step);
            }
            RequestKind::DeleteFile { file_id } => {
                let result = completion.outcome.map(|_| {
                    if self.store.clear_local_file(file_id) {
                        debug!(%file_id, "local copy deleted");
                        self.touch_open_timelines(step);
                    }
                    OutcomeDetail::Done
                });
                self.finish(completion.origin, result, step);
            }
            RequestKind::FileRefresh { file_id } => {
                let file = completion
                    .outcome
                    .and_then(|response| file_from_value(&response).map_err(SyncError::from));
                match file {
                    Ok(file) => {
                        let idle = !file.downloading;
                        self.on_file(file, step);
                        if idle && let Some(priority) = self.downloads.release(file_id) {
                            debug!(%file_id, priority, "refreshed file is idle; slot released");
                        }
                    }
                    Err(err) => warn!(%file_id, error = %err, "file refresh failed"),
                }
            }
            RequestKind::UserRefresh { user_id } => {
                let user = completion
                    .outcome
                    .and_then(|response| user_from_value(&response).map_err(SyncError::from));
                match user {
                    Ok(patch) => {
                        if self.store.upsert_user(&patch) {
                            step.change(Change::ChatList);
                            self.touch_open_timelines(step);
                        }
                    }
                    Err(err) => warn!(%user_id, error = %err, "user refresh failed"),
                }
            }
        }
    }

    fn complete_chat_list(&mut self, completion: Completion, now: Instant, step: &mut Step) {
        if self.chat_list_request == Some(completion.id) {
            self.chat_list_request = None;
        }
        match completion.outcome {
            Ok(_) => {
                let count = self.store.chat_count();
                if count < self.config.chat_rows && count > self.chats_before_load {
                    self.request_chat_list(now, step);
                }
            }
            // The backend answers 404 once every chat has been announced.
            Err(err) if err.code == "backend_error_404" => {
                debug!("chat list fully loaded");
            }
            Err(err) => {
                warn!(error = %err, "chat list load failed");
                self.note_error(err, step);
            }
        }
        if self.chat_list_request.is_none() && self.tolerate_unannounced {
            debug!("chat list reloaded after overflow");
            self.tolerate_unannounced = false;
        }
    }

    fn complete_latest_page(
        &mut self,
        chat_id: ChatId,
        completion: Completion,
        now: Instant,
        step: &mut Step,
    ) {
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            self.defect(
                SyncError::programming(
                    "page_without_chat",
                    format!("history page for chat {chat_id} that has no sync record"),
                ),
                step,
            );
            return;
        };
        if sync.latest_request != Some(completion.id) {
            debug!(%chat_id, request_id = %completion.id, "superseded history page");
            step.report(completion.origin, Ok(OutcomeDetail::Discarded));
            return;
        }
        sync.latest_request = None;

        if !completion.interested {
            debug!(%chat_id, "discarding history page for closed chat");
            self.reset_chat(chat_id);
            step.change(Change::Timeline(chat_id));
            step.report(completion.origin, Ok(OutcomeDetail::Discarded));
            return;
        }

        let page = completion
            .outcome
            .and_then(|response| page_from_value(&response).map_err(SyncError::from));
        match page {
            Ok(messages) => self.apply_latest_page(chat_id, messages, completion.origin, now, step),
            Err(err) => {
                let delay = sync
                    .retry
                    .schedule(&self.config.retry, now, err.retry_after_ms);
                warn!(
                    %chat_id,
                    error = %err,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "history page failed; retry scheduled"
                );
                step.report(completion.origin, Err(err.clone()));
                self.note_error(err, step);
            }
        }
    }

    fn apply_latest_page(
        &mut self,
        chat_id: ChatId,
        messages: Vec<Message>,
        origin: Option<Origin>,
        now: Instant,
        step: &mut Step,
    ) {
        let limit = self.config.page_limit();
        let span = PageSpan::from_ids(messages.iter().filter_map(|m| m.id.remote()), limit);
        let count = messages.len();
        for message in messages {
            self.store.upsert_message(message);
        }

        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return;
        };
        let buffer = std::mem::take(&mut sync.buffer);
        let stale = std::mem::take(&mut sync.stale_page);
        let buffered_span = buffer.added_span();
        debug!(%chat_id, count, buffered = buffer.len(), "applying latest page");
        self.replay(chat_id, buffer);
        self.store
            .window_mut(chat_id)
            .absorb_latest_page(span, buffered_span);

        let gap = self.has_gap(chat_id);
        let last_message = self
            .store
            .chat(chat_id)
            .and_then(|chat| chat.last_message)
            .and_then(MessageId::remote);
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return;
        };

        if stale || (gap && sync.gap_refetches < self.config.max_gap_refetches) {
            if !stale {
                sync.gap_refetches += 1;
            }
            debug!(%chat_id, stale, attempt = sync.gap_refetches, "page left a gap; refetching");
            if !self.delivery_interrupted {
                self.request_latest_page(chat_id, None, now, step);
            }
        } else {
            sync.gap_refetches = 0;
            sync.retry.reset();
            let transition = sync.machine.page_applied();
            if gap && let Some(last) = last_message {
                warn!(%chat_id, last, "gap could not be closed; marked in timeline");
                self.store.window_mut(chat_id).mark_gap(last);
            }
            match transition {
                Ok(state) => debug!(%chat_id, ?state, "chat synchronized"),
                Err(err) => self.defect(err, step),
            }
        }

        step.change(Change::Timeline(chat_id));
        step.change(Change::ChatList);
        let has_more = self
            .store
            .window(chat_id)
            .is_some_and(TimelineWindow::has_more_history);
        step.report(
            origin,
            Ok(OutcomeDetail::HistoryLoaded {
                chat_id,
                count,
                has_more,
            }),
        );
    }

    fn complete_older_page(
        &mut self,
        chat_id: ChatId,
        anchor: i64,
        completion: Completion,
        step: &mut Step,
    ) {
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return;
        };
        if sync.older_request != Some(completion.id) {
            step.report(completion.origin, Ok(OutcomeDetail::Discarded));
            return;
        }
        sync.older_request = None;
        if !completion.interested {
            debug!(%chat_id, "discarding older page for closed chat");
            step.report(completion.origin, Ok(OutcomeDetail::Discarded));
            return;
        }

        let page = completion
            .outcome
            .and_then(|response| page_from_value(&response).map_err(SyncError::from));
        let messages = match page {
            Ok(messages) => messages,
            Err(err) => {
                self.finish(completion.origin, Err(err), step);
                return;
            }
        };

        let limit = self.config.page_limit();
        let span = PageSpan::from_ids(messages.iter().filter_map(|m| m.id.remote()), limit);
        let count = messages.len();
        for message in messages {
            self.store.upsert_message(message);
        }
        let window = self.store.window_mut(chat_id);
        if window.is_initialized() {
            window.absorb_older_page(anchor, span);
        }
        let has_more = window.has_more_history();
        debug!(%chat_id, count, has_more, "older page applied");
        step.change(Change::Timeline(chat_id));
        step.report(
            completion.origin,
            Ok(OutcomeDetail::HistoryLoaded {
                chat_id,
                count,
                has_more,
            }),
        );
    }

    fn complete_send(
        &mut self,
        chat_id: ChatId,
        local_id: LocalId,
        completion: Completion,
        step: &mut Step,
    ) {
        let local = MessageId::Local(local_id);
        let sent = completion
            .outcome
            .and_then(|response| message_from_value(&response).map_err(SyncError::from));
        match sent {
            Ok(message) if message.send_state == SendState::PendingLocal => {
                let Some(temporary) = message.id.remote() else {
                    return;
                };
                // A late answer already failed the intent; the row waits again.
                let origin = if completion.late {
                    if self.store.set_send_state(chat_id, local, SendState::PendingLocal) {
                        step.change(Change::Timeline(chat_id));
                    }
                    None
                } else {
                    completion.origin
                };
                debug!(%chat_id, %local, temporary, "send accepted; awaiting confirmation");
                self.awaiting_confirmation
                    .insert((chat_id, temporary), AwaitingConfirmation { local_id, origin });
            }
            Ok(message) => {
                let assigned = message.id;
                self.remap(chat_id, local_id, message, step);
                if completion.late {
                    info!(%chat_id, %local, %assigned, "late send confirmation applied");
                } else {
                    step.report(
                        completion.origin,
                        Ok(OutcomeDetail::Sent { local_id, assigned }),
                    );
                }
            }
            Err(_) if completion.late => {}
            Err(err) => {
                if self.store.set_send_state(chat_id, local, SendState::Failed) {
                    step.change(Change::Timeline(chat_id));
                }
                warn!(%chat_id, %local, error = %err, "send failed");
                self.finish(completion.origin, Err(err), step);
            }
        }
    }

    /// Move an optimistic message onto its assigned id.
    fn remap(&mut self, chat_id: ChatId, local_id: LocalId, message: Message, step: &mut Step) {
        let local = MessageId::Local(local_id);
        let assigned = message.id;
        let sync = self.chats.entry(chat_id).or_default();
        if sync.selection == Some(local) {
            sync.selection = Some(assigned);
        }
        let live = sync.machine.state() == ChatSyncState::Live;
        if sync.machine.buffers_live_updates() {
            sync.buffer.push_added(message.clone());
        }
        self.store.remap_message(chat_id, local, message);
        self.local_index.remove(&local_id);
        if live && let Some(remote) = assigned.remote() {
            self.store.window_mut(chat_id).extend_newest(remote);
        }
        debug!(%chat_id, %local, %assigned, "optimistic message remapped");
        step.change(Change::Timeline(chat_id));
        step.change(Change::ChatList);
    }

    fn open_chat(
        &mut self,
        chat_id: ChatId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        let sync = self.chats.entry(chat_id).or_default();
        sync.open = true;
        step.change(Change::Timeline(chat_id));
        step.change(Change::ChatList);

        for id in [sync.latest_request, sync.older_request].into_iter().flatten() {
            self.tracker.reinterest(id);
        }
        match sync.machine.state() {
            ChatSyncState::Uninitialized => {
                sync.machine.begin_backfill()?;
                debug!(%chat_id, "opening chat; requesting initial page");
                self.request_latest_page(chat_id, Some(origin), now, step);
                Ok(None)
            }
            ChatSyncState::BackfillInFlight | ChatSyncState::Resyncing
                if sync.latest_request.is_none()
                    && !sync.retry.is_scheduled()
                    && !self.delivery_interrupted =>
            {
                self.request_latest_page(chat_id, Some(origin), now, step);
                Ok(None)
            }
            _ => Ok(Some(OutcomeDetail::Done)),
        }
    }

    fn close_chat(&mut self, chat_id: ChatId, step: &mut Step) -> IntentResult {
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return Ok(Some(OutcomeDetail::Done));
        };
        sync.open = false;
        for id in [sync.latest_request, sync.older_request].into_iter().flatten() {
            self.tracker.abandon(id);
        }
        if sync.machine.buffers_live_updates() && sync.latest_request.is_none() {
            self.reset_chat(chat_id);
        }
        step.change(Change::Timeline(chat_id));
        step.change(Change::ChatList);
        Ok(Some(OutcomeDetail::Done))
    }

    fn load_more_history(
        &mut self,
        chat_id: ChatId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        let sync = self.chats.entry(chat_id).or_default();
        match sync.machine.state() {
            ChatSyncState::Uninitialized => {
                sync.machine.begin_backfill()?;
                self.request_latest_page(chat_id, Some(origin), now, step);
                Ok(None)
            }
            ChatSyncState::Live => {
                if sync.older_request.is_some() {
                    return Ok(Some(OutcomeDetail::Done));
                }
                let window = self.store.window(chat_id);
                let anchor = window.and_then(TimelineWindow::oldest);
                let has_more = window.is_some_and(TimelineWindow::has_more_history);
                let Some(anchor) = anchor.filter(|_| has_more) else {
                    return Ok(Some(OutcomeDetail::HistoryLoaded {
                        chat_id,
                        count: 0,
                        has_more: false,
                    }));
                };
                let limit = self.config.page_limit();
                let id = self.submit(
                    RequestKind::OlderPage { chat_id, anchor },
                    Some(origin),
                    now,
                    step,
                    |id| wire::get_chat_history(id, chat_id, Some(anchor), limit),
                );
                if let Some(sync) = self.chats.get_mut(&chat_id) {
                    sync.older_request = Some(id);
                }
                Ok(None)
            }
            state => Err(SyncError::invalid_state(state, "load_more_history")),
        }
    }

    fn send_message(
        &mut self,
        chat_id: ChatId,
        text: &str,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::rejected("empty_message", "message text is empty"));
        }

        let local_id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        self.store.upsert_message(Message {
            id: MessageId::Local(local_id),
            chat_id,
            sender: self.config.own_user_id,
            date: unix_now(),
            content: MessageContent::Text {
                text: text.to_owned(),
            },
            revision: 0,
            send_state: SendState::PendingLocal,
        });
        self.local_index.insert(local_id, chat_id);
        debug!(%chat_id, %local_id, "optimistic message inserted");

        self.submit(
            RequestKind::Send { chat_id, local_id },
            Some(origin),
            now,
            step,
            |id| wire::send_text(id, chat_id, text),
        );
        step.change(Change::Timeline(chat_id));
        step.change(Change::ChatList);
        Ok(None)
    }

    fn retry_failed_send(
        &mut self,
        local_id: LocalId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        let (chat_id, text) = self.failed_local_message(local_id)?;
        let text = match text {
            Some(text) => text,
            None => {
                return Err(SyncError::rejected(
                    "not_retryable",
                    format!("message {local_id} has no text to resend"),
                ));
            }
        };
        self.store
            .set_send_state(chat_id, MessageId::Local(local_id), SendState::PendingLocal);
        self.submit(
            RequestKind::Send { chat_id, local_id },
            Some(origin),
            now,
            step,
            |id| wire::send_text(id, chat_id, &text),
        );
        step.change(Change::Timeline(chat_id));
        Ok(None)
    }

    fn dismiss_failed_send(&mut self, local_id: LocalId, step: &mut Step) -> IntentResult {
        let (chat_id, _) = self.failed_local_message(local_id)?;
        let local = MessageId::Local(local_id);
        self.store.remove_message(chat_id, local);
        self.local_index.remove(&local_id);
        self.awaiting_confirmation
            .retain(|_, awaiting| awaiting.local_id != local_id);
        if let Some(sync) = self.chats.get_mut(&chat_id)
            && sync.selection == Some(local)
        {
            sync.selection = None;
        }
        step.change(Change::Timeline(chat_id));
        Ok(Some(OutcomeDetail::Done))
    }

    fn failed_local_message(
        &self,
        local_id: LocalId,
    ) -> Result<(ChatId, Option<String>), SyncError> {
        let message = self
            .local_index
            .get(&local_id)
            .and_then(|chat_id| self.store.message(*chat_id, MessageId::Local(local_id)))
            .ok_or_else(|| {
                SyncError::rejected("message_not_found", format!("no local message {local_id}"))
            })?;
        if message.send_state != SendState::Failed {
            return Err(SyncError::rejected(
                "not_failed",
                format!("message {local_id} is {:?}", message.send_state),
            ));
        }
        let text = match &message.content {
            MessageContent::Text { text } => Some(text.clone()),
            _ => None,
        };
        Ok((message.chat_id, text))
    }

    fn mark_read(
        &mut self,
        chat_id: ChatId,
        message_id: MessageId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        let remote = remote_id(message_id)?;
        let previous = self.store.chat(chat_id).and_then(|chat| chat.last_read_inbox);
        if self.store.advance_read_marker(chat_id, message_id) {
            step.change(Change::ChatList);
        }
        self.submit(
            RequestKind::MarkRead {
                chat_id,
                message_id,
                previous,
            },
            Some(origin),
            now,
            step,
            |id| wire::view_messages(id, chat_id, &[remote]),
        );
        Ok(None)
    }

    fn edit_message(
        &mut self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        let remote = remote_id(message_id)?;
        match self.store.message(chat_id, message_id) {
            Some(message) if !message.content.is_deleted() => {}
            _ => {
                return Err(SyncError::rejected(
                    "message_not_found",
                    format!("message {message_id} is not editable"),
                ));
            }
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::rejected("empty_message", "message text is empty"));
        }
        self.submit(
            RequestKind::Edit {
                chat_id,
                message_id: remote,
            },
            Some(origin),
            now,
            step,
            |id| wire::edit_text(id, chat_id, remote, text),
        );
        Ok(None)
    }

    fn delete_messages(
        &mut self,
        chat_id: ChatId,
        message_ids: &[MessageId],
        revoke: bool,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        // Deleting one part of an album deletes the whole album.
        let mut targets = BTreeSet::new();
        for id in message_ids {
            targets.insert(remote_id(*id)?);
            if let Some(album_id) = self
                .store
                .message(chat_id, *id)
                .and_then(|message| message.content.album_id())
            {
                targets.extend(
                    self.store
                        .album_members(chat_id, album_id)
                        .filter_map(MessageId::remote),
                );
            }
        }
        if targets.is_empty() {
            return Err(SyncError::rejected("nothing_to_delete", "no message ids given"));
        }
        let remote: Vec<i64> = targets.into_iter().collect();
        self.submit(
            RequestKind::Delete {
                chat_id,
                message_ids: remote.clone(),
            },
            Some(origin),
            now,
            step,
            |id| wire::delete_messages(id, chat_id, &remote, revoke),
        );
        Ok(None)
    }

    fn select_message(
        &mut self,
        chat_id: ChatId,
        message_id: Option<MessageId>,
        step: &mut Step,
    ) -> IntentResult {
        self.known_chat(chat_id)?;
        if let Some(id) = message_id
            && !self.store.has_message(chat_id, id)
        {
            return Err(SyncError::rejected(
                "message_not_found",
                format!("message {id} is not in chat {chat_id}"),
            ));
        }
        self.chats.entry(chat_id).or_default().selection = message_id;
        step.change(Change::Timeline(chat_id));
        Ok(Some(OutcomeDetail::Done))
    }

    fn download_file(
        &mut self,
        file_id: FileId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        if self.store.file(file_id).is_some_and(FileState::completed)
            || self.downloads.priority_of(file_id).is_some()
        {
            return Ok(Some(OutcomeDetail::Done));
        }
        let priority = self.downloads.acquire(file_id).ok_or_else(|| {
            SyncError::rejected("download_slots_exhausted", "every download priority slot is taken")
        })?;
        debug!(%file_id, priority, "starting download");
        self.submit(
            RequestKind::Download { file_id, priority },
            Some(origin),
            now,
            step,
            |id| wire::download_file(id, file_id, priority),
        );
        Ok(None)
    }

    fn cancel_download(
        &mut self,
        file_id: FileId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        if let Some(priority) = self.downloads.release(file_id) {
            debug!(%file_id, priority, "download cancelled; slot released");
        }
        self.submit(
            RequestKind::CancelDownload { file_id },
            Some(origin),
            now,
            step,
            |id| wire::cancel_download(id, file_id),
        );
        Ok(None)
    }

    fn delete_local_file(
        &mut self,
        file_id: FileId,
        origin: Origin,
        now: Instant,
        step: &mut Step,
    ) -> IntentResult {
        if let Some(priority) = self.downloads.release(file_id) {
            debug!(%file_id, priority, "deleting file mid-download; slot released");
        }
        self.submit(
            RequestKind::DeleteFile { file_id },
            Some(origin),
            now,
            step,
            |id| wire::delete_file(id, file_id),
        );
        Ok(None)
    }

    fn submit(
        &mut self,
        kind: RequestKind,
        origin: Option<Origin>,
        now: Instant,
        step: &mut Step,
        build: impl FnOnce(RequestId) -> Value,
    ) -> RequestId {
        let id = self.tracker.submit(kind, origin, now);
        step.requests.push(build(id));
        step.change(Change::Status);
        id
    }

    fn request_chat_list(&mut self, now: Instant, step: &mut Step) {
        if self.chat_list_request.is_some() {
            return;
        }
        let limit = self.config.chat_list_limit;
        self.chats_before_load = self.store.chat_count();
        let id = self.submit(RequestKind::LoadChats, None, now, step, |id| {
            wire::load_chats(id, limit)
        });
        self.chat_list_request = Some(id);
    }

    fn request_latest_page(
        &mut self,
        chat_id: ChatId,
        origin: Option<Origin>,
        now: Instant,
        step: &mut Step,
    ) {
        let limit = self.config.page_limit();
        let id = self.submit(
            RequestKind::LatestPage { chat_id },
            origin,
            now,
            step,
            |id| wire::get_chat_history(id, chat_id, None, limit),
        );
        let sync = self.chats.entry(chat_id).or_default();
        sync.latest_request = Some(id);
        sync.stale_page = false;
        sync.retry.cancel();
    }

    /// Leave `Live` after lost updates; fetch a fresh page when the chat is
    /// open, otherwise drop the window until it is opened again.
    fn begin_resync(&mut self, chat_id: ChatId, now: Instant, step: &mut Step) {
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return;
        };
        if sync.machine.interrupt().is_some() {
            debug!(%chat_id, "chat resyncing");
            step.change(Change::Timeline(chat_id));
        }
        if sync.machine.state() != ChatSyncState::Resyncing {
            return;
        }
        if sync.latest_request.is_some() {
            sync.stale_page = true;
            return;
        }
        if !sync.open {
            self.reset_chat(chat_id);
        } else if !self.delivery_interrupted {
            self.request_latest_page(chat_id, None, now, step);
        }
    }

    /// Return a chat nobody is looking at to `Uninitialized`, folding its
    /// buffered updates into the store.
    fn reset_chat(&mut self, chat_id: ChatId) {
        let Some(sync) = self.chats.get_mut(&chat_id) else {
            return;
        };
        if sync.machine.abandon().is_err() {
            return;
        }
        let buffer = std::mem::take(&mut sync.buffer);
        sync.retry.reset();
        sync.stale_page = false;
        sync.gap_refetches = 0;
        debug!(%chat_id, buffered = buffer.len(), "chat returned to uninitialized");
        self.replay(chat_id, buffer);
        self.store.reset_window(chat_id);
    }

    /// Apply buffered live updates in id order through the idempotent upsert.
    fn replay(&mut self, chat_id: ChatId, mut buffer: LiveBuffer) {
        for (id, entry) in buffer.drain() {
            if let Some(message) = entry.added {
                self.store.upsert_message(message);
            }
            if let Some(edit) = entry.edit {
                self.store.apply_edit(&edit);
            }
            if entry.deleted {
                self.store.tombstone(chat_id, id);
            }
        }
    }

    /// The chat's last message lies past the window and is unknown.
    fn has_gap(&self, chat_id: ChatId) -> bool {
        let Some(MessageId::Remote(last)) = self.store.chat(chat_id).and_then(|c| c.last_message)
        else {
            return false;
        };
        let newest = self.store.window(chat_id).and_then(TimelineWindow::newest);
        newest.is_none_or(|newest| last > newest)
            && !self.store.has_message(chat_id, MessageId::Remote(last))
    }

    fn is_last_message(&self, chat_id: ChatId, id: MessageId) -> bool {
        self.store
            .chat(chat_id)
            .is_some_and(|chat| chat.last_message == Some(id))
    }

    fn touch_message(&self, chat_id: ChatId, id: MessageId, step: &mut Step) {
        if self
            .store
            .window(chat_id)
            .is_some_and(|window| window.contains(id))
        {
            step.change(Change::Timeline(chat_id));
        }
        if self.is_last_message(chat_id, id) {
            step.change(Change::ChatList);
        }
    }

    fn touch_open_timelines(&self, step: &mut Step) {
        for chat_id in self.open_chats() {
            step.change(Change::Timeline(chat_id));
        }
    }

    fn known_chat(&self, chat_id: ChatId) -> Result<(), SyncError> {
        if self.store.has_chat(chat_id) {
            Ok(())
        } else {
            Err(SyncError::rejected("unknown_chat", format!("chat {chat_id} is not known")))
        }
    }

    fn ensure_known_chat(&mut self, chat_id: ChatId, what: &str, step: &mut Step) -> bool {
        if self.store.has_chat(chat_id) {
            return true;
        }
        if self.tolerate_unannounced {
            warn!(%chat_id, what, "update for a chat lost to overflow; waiting for chat list");
            return false;
        }
        self.defect(
            SyncError::programming(
                "unknown_chat",
                format!("{what} for chat {chat_id} that was never announced"),
            ),
            step,
        );
        false
    }

    fn finish(
        &mut self,
        origin: Option<Origin>,
        result: Result<OutcomeDetail, SyncError>,
        step: &mut Step,
    ) {
        if let Err(err) = &result {
            self.note_error(err.clone(), step);
        }
        step.report(origin, result);
    }

    fn note_error(&mut self, err: SyncError, step: &mut Step) {
        self.last_error = Some(err);
        step.change(Change::Status);
    }

    fn defect(&mut self, err: SyncError, step: &mut Step) {
        error!(code = %err.code, message = %err.message, "sync engine defect");
        if self.config.panic_on_defect {
            panic!("sync engine defect: {err}");
        }
        step.events.push(EngineEvent::Defect(err));
    }
}

fn remote_id(id: MessageId) -> Result<i64, SyncError> {
    id.remote().ok_or_else(|| {
        SyncError::rejected("local_message", format!("message {id} has not been sent yet"))
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_secs()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        error::SyncErrorCategory,
        ingress::IngressQueue,
        normalization::normalize,
        timeline::{Anchor, Direction},
        types::{ChatPosition, LocalId, MediaKind, UserPatch},
    };

    const CHAT: ChatId = ChatId(10);

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            page_size: 3,
            panic_on_defect: false,
            own_user_id: UserId(1),
            ..EngineConfig::default()
        })
    }

    fn text(id: i64, revision: u64, body: &str) -> Message {
        Message {
            id: MessageId::Remote(id),
            chat_id: CHAT,
            sender: UserId(2),
            date: id,
            content: MessageContent::Text {
                text: body.to_owned(),
            },
            revision,
            send_state: SendState::Sent,
        }
    }

    fn edit(id: i64, revision: u64, body: &str) -> MessageEdit {
        MessageEdit {
            chat_id: CHAT,
            message_id: MessageId::Remote(id),
            content: MessageContent::Text {
                text: body.to_owned(),
            },
            revision,
        }
    }

    fn message_json(id: i64, body: &str) -> Value {
        json!({
            "@type": "message",
            "id": id,
            "chat_id": CHAT.0,
            "sender_id": {"@type": "messageSenderUser", "user_id": 2},
            "date": id,
            "content": {"@type": "messageText", "text": {"@type": "formattedText", "text": body}},
        })
    }

    /// History pages list the newest message first.
    fn page(ids: &[i64]) -> Value {
        let messages: Vec<Value> = ids
            .iter()
            .rev()
            .map(|id| message_json(*id, &format!("m{id}")))
            .collect();
        json!({"@type": "messages", "total_count": messages.len(), "messages": messages})
    }

    fn announce(engine: &mut Engine, now: Instant) {
        let mut meta = ChatMeta::new(CHAT);
        meta.title = Some("general".to_owned());
        engine.apply_update(Update::ChatMetaChanged(meta), now);
    }

    fn request_id(request: &Value) -> RequestId {
        RequestId(request["@extra"].as_u64().expect("request carries @extra"))
    }

    fn find_request<'a>(step: &'a Step, kind: &str) -> &'a Value {
        step.requests
            .iter()
            .find(|request| request["@type"] == kind)
            .unwrap_or_else(|| panic!("no {kind} request in {:?}", step.requests))
    }

    fn respond(engine: &mut Engine, id: RequestId, payload: Value, now: Instant) -> Step {
        engine.apply_update(
            Update::RequestResult {
                id,
                payload: Ok(payload),
            },
            now,
        )
    }

    fn reject(engine: &mut Engine, id: RequestId, err: SyncError, now: Instant) -> Step {
        engine.apply_update(
            Update::RequestResult {
                id,
                payload: Err(err),
            },
            now,
        )
    }

    fn intent(engine: &mut Engine, ticket: u64, intent: Intent, now: Instant) -> Step {
        engine.apply_intent(IntentTicket(ticket), intent, now)
    }

    fn open(engine: &mut Engine, now: Instant) -> RequestId {
        let step = intent(engine, 1, Intent::OpenChat { chat_id: CHAT }, now);
        request_id(find_request(&step, "getChatHistory"))
    }

    fn live_chat(ids: &[i64], now: Instant) -> Engine {
        let mut engine = engine();
        announce(&mut engine, now);
        let id = open(&mut engine, now);
        respond(&mut engine, id, page(ids), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
        engine
    }

    fn timeline(engine: &Engine) -> Vec<MessageId> {
        engine
            .store()
            .timeline_window(CHAT, Anchor::Oldest, Direction::Forward, 100)
            .map(|message| message.id)
            .collect()
    }

    fn remote(ids: &[i64]) -> Vec<MessageId> {
        ids.iter().copied().map(MessageId::Remote).collect()
    }

    fn body(engine: &Engine, id: MessageId) -> String {
        engine
            .store()
            .message(CHAT, id)
            .map(|message| message.content.preview())
            .unwrap_or_default()
    }

    fn outcome(step: &Step) -> &IntentOutcome {
        step.outcomes().next().expect("step reports an outcome")
    }

    fn has_defect(step: &Step, code: &str) -> bool {
        step.events
            .iter()
            .any(|event| matches!(event, EngineEvent::Defect(err) if err.code == code))
    }

    #[test]
    fn open_chat_backfills_then_goes_live() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);

        let step = intent(&mut engine, 7, Intent::OpenChat { chat_id: CHAT }, now);
        let request = find_request(&step, "getChatHistory");
        assert_eq!(request["from_message_id"], 0);
        assert_eq!(request["limit"], 3);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::BackfillInFlight);
        assert_eq!(engine.syncing_chats(), 1);

        let step = respond(&mut engine, request_id(request), page(&[1, 2, 3]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
        assert_eq!(timeline(&engine), remote(&[1, 2, 3]));
        assert!(step.changes.contains(&Change::Timeline(CHAT)));
        let reported = outcome(&step);
        assert_eq!(reported.ticket, IntentTicket(7));
        assert_eq!(
            reported.result,
            Ok(OutcomeDetail::HistoryLoaded {
                chat_id: CHAT,
                count: 3,
                has_more: true,
            })
        );
    }

    #[test]
    fn final_state_does_not_depend_on_update_arrival_order() {
        let now = Instant::now();

        let mut buffered = engine();
        announce(&mut buffered, now);
        let id = open(&mut buffered, now);
        buffered.apply_update(Update::MessageAdded(text(5, 0, "five")), now);
        buffered.apply_update(Update::MessageAdded(text(4, 0, "four")), now);
        buffered.apply_update(Update::MessageEdited(edit(2, 9, "two v9")), now);
        buffered.apply_update(Update::MessageEdited(edit(2, 4, "two v4")), now);
        assert!(timeline(&buffered).is_empty());
        respond(&mut buffered, id, page(&[1, 2, 3]), now);

        let mut direct = live_chat(&[1, 2, 3], now);
        direct.apply_update(Update::MessageEdited(edit(2, 4, "two v4")), now);
        direct.apply_update(Update::MessageAdded(text(4, 0, "four")), now);
        direct.apply_update(Update::MessageEdited(edit(2, 9, "two v9")), now);
        direct.apply_update(Update::MessageAdded(text(5, 0, "five")), now);

        for engine in [&buffered, &direct] {
            assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
            assert_eq!(timeline(engine), remote(&[1, 2, 3, 4, 5]));
            assert_eq!(body(engine, MessageId::Remote(2)), "two v9");
        }
    }

    #[test]
    fn reapplied_updates_change_nothing() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);

        let first = engine.apply_update(Update::MessageAdded(text(4, 0, "four")), now);
        assert!(first.changes.contains(&Change::Timeline(CHAT)));
        let again = engine.apply_update(Update::MessageAdded(text(4, 0, "four")), now);
        assert!(again.is_empty());

        engine.apply_update(Update::MessageEdited(edit(4, 3, "four v3")), now);
        let stale = engine.apply_update(Update::MessageEdited(edit(4, 2, "four v2")), now);
        assert!(stale.is_empty());
        assert_eq!(body(&engine, MessageId::Remote(4)), "four v3");
        assert_eq!(engine.store().message_count(CHAT), 4);
    }

    #[test]
    fn deletion_leaves_tombstone_in_place() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);

        engine.apply_update(
            Update::MessageDeleted {
                chat_id: CHAT,
                message_ids: remote(&[3]),
                from_cache: true,
            },
            now,
        );
        assert_eq!(body(&engine, MessageId::Remote(3)), "m3");

        engine.apply_update(
            Update::MessageDeleted {
                chat_id: CHAT,
                message_ids: remote(&[2]),
                from_cache: false,
            },
            now,
        );
        assert_eq!(timeline(&engine), remote(&[1, 2, 3]));
        assert!(
            engine
                .store()
                .message(CHAT, MessageId::Remote(2))
                .is_some_and(|message| message.content.is_deleted())
        );

        engine.apply_update(Update::MessageEdited(edit(2, 5, "revived")), now);
        assert_eq!(body(&engine, MessageId::Remote(2)), "message deleted");
    }

    #[test]
    fn send_shows_pending_row_then_remaps_with_selection() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);

        let step = intent(
            &mut engine,
            7,
            Intent::SendMessage {
                chat_id: CHAT,
                text: " hi ".to_owned(),
            },
            now,
        );
        let request = find_request(&step, "sendMessage");
        assert_eq!(request["input_message_content"]["text"]["text"], "hi");
        let local = MessageId::Local(LocalId(0));
        assert_eq!(timeline(&engine).last(), Some(&local));
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::PendingLocal)
        );

        intent(
            &mut engine,
            8,
            Intent::SelectMessage {
                chat_id: CHAT,
                message_id: Some(local),
            },
            now,
        );
        let step = respond(&mut engine, request_id(request), message_json(4, "hi"), now);

        assert!(!engine.store().has_message(CHAT, local));
        assert_eq!(timeline(&engine), remote(&[1, 2, 3, 4]));
        assert_eq!(
            engine
                .store()
                .message(CHAT, MessageId::Remote(4))
                .map(|m| m.send_state),
            Some(SendState::Sent)
        );
        assert_eq!(engine.selection(CHAT), Some(MessageId::Remote(4)));
        assert_eq!(
            outcome(&step).result,
            Ok(OutcomeDetail::Sent {
                local_id: LocalId(0),
                assigned: MessageId::Remote(4),
            })
        );
    }

    #[test]
    fn send_response_merges_with_live_copy() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let step = intent(
            &mut engine,
            7,
            Intent::SendMessage {
                chat_id: CHAT,
                text: "hi".to_owned(),
            },
            now,
        );
        let id = request_id(find_request(&step, "sendMessage"));

        engine.apply_update(Update::MessageAdded(text(2, 0, "hi")), now);
        respond(&mut engine, id, message_json(2, "hi"), now);

        assert_eq!(timeline(&engine), remote(&[1, 2]));
        assert_eq!(engine.store().message_count(CHAT), 2);
    }

    #[test]
    fn failed_send_stays_visible_for_retry_and_dismiss() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let local = MessageId::Local(LocalId(0));
        let step = intent(
            &mut engine,
            7,
            Intent::SendMessage {
                chat_id: CHAT,
                text: "hi".to_owned(),
            },
            now,
        );
        let id = request_id(find_request(&step, "sendMessage"));

        let step = reject(
            &mut engine,
            id,
            SyncError::request_failed(400, "CHAT_WRITE_FORBIDDEN"),
            now,
        );
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::Failed)
        );
        assert_eq!(outcome(&step).ticket, IntentTicket(7));
        assert!(outcome(&step).result.is_err());
        assert!(engine.last_error().is_some());

        let step = intent(
            &mut engine,
            8,
            Intent::RetryFailedSend {
                message_id: LocalId(0),
            },
            now,
        );
        let retry = request_id(find_request(&step, "sendMessage"));
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::PendingLocal)
        );

        let step = intent(
            &mut engine,
            9,
            Intent::DismissFailedSend {
                message_id: LocalId(0),
            },
            now,
        );
        assert_eq!(
            outcome(&step).result.as_ref().map_err(|err| err.code.as_str()),
            Err("not_failed")
        );

        reject(&mut engine, retry, SyncError::request_failed(400, "nope"), now);
        let step = intent(
            &mut engine,
            10,
            Intent::DismissFailedSend {
                message_id: LocalId(0),
            },
            now,
        );
        assert_eq!(outcome(&step).result, Ok(OutcomeDetail::Done));
        assert!(!engine.store().has_message(CHAT, local));
    }

    #[test]
    fn timed_out_send_is_repaired_by_late_success() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let local = MessageId::Local(LocalId(0));
        let step = intent(
            &mut engine,
            7,
            Intent::SendMessage {
                chat_id: CHAT,
                text: "hi".to_owned(),
            },
            now,
        );
        let id = request_id(find_request(&step, "sendMessage"));

        let step = engine.tick(now + Duration::from_secs(6));
        let timed_out = outcome(&step);
        assert_eq!(timed_out.ticket, IntentTicket(7));
        assert_eq!(
            timed_out.result.as_ref().map_err(|err| err.category),
            Err(SyncErrorCategory::RequestTimeout)
        );
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::Failed)
        );

        let step = respond(&mut engine, id, message_json(2, "hi"), now);
        assert_eq!(step.outcomes().count(), 0);
        assert!(!engine.store().has_message(CHAT, local));
        assert_eq!(timeline(&engine), remote(&[1, 2]));
    }

    #[test]
    fn transport_loss_resyncs_without_losing_messages() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);

        let step = engine.apply_update(
            Update::ConnectionStateChanged(ConnectionState::Disconnected),
            now,
        );
        assert!(step.requests.is_empty());
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Resyncing);

        engine.apply_update(Update::MessageAdded(text(4, 0, "four")), now);
        let step = engine.apply_update(
            Update::ConnectionStateChanged(ConnectionState::Connected),
            now,
        );
        find_request(&step, "loadChats");
        let id = request_id(find_request(&step, "getChatHistory"));

        respond(&mut engine, id, page(&[4, 5, 6]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
        assert_eq!(timeline(&engine), remote(&[1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn page_requested_before_loss_is_refetched() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        let first = open(&mut engine, now);

        engine.apply_update(
            Update::ConnectionStateChanged(ConnectionState::Connecting),
            now,
        );
        engine.apply_update(
            Update::ConnectionStateChanged(ConnectionState::Disconnected),
            now,
        );
        let step = engine.apply_update(
            Update::ConnectionStateChanged(ConnectionState::Connected),
            now,
        );
        assert!(
            !step
                .requests
                .iter()
                .any(|request| request["@type"] == "getChatHistory")
        );

        let step = respond(&mut engine, first, page(&[1, 2, 3]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Resyncing);
        let second = request_id(find_request(&step, "getChatHistory"));

        respond(&mut engine, second, page(&[2, 3, 4]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
        assert_eq!(timeline(&engine), remote(&[1, 2, 3, 4]));
    }

    #[test]
    fn page_for_closed_chat_is_discarded() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        let id = open(&mut engine, now);
        intent(&mut engine, 2, Intent::CloseChat { chat_id: CHAT }, now);

        engine.apply_update(Update::MessageAdded(text(9, 0, "nine")), now);
        let step = respond(&mut engine, id, page(&[1, 2, 3]), now);
        assert_eq!(outcome(&step).result, Ok(OutcomeDetail::Discarded));
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Uninitialized);
        assert!(engine.store().window(CHAT).is_none());
        assert!(!engine.store().has_message(CHAT, MessageId::Remote(1)));
        assert!(engine.store().has_message(CHAT, MessageId::Remote(9)));

        open(&mut engine, now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::BackfillInFlight);
    }

    #[test]
    fn updates_for_unknown_chats_are_defects() {
        let now = Instant::now();
        let mut engine = engine();

        let step = engine.apply_update(Update::MessageAdded(text(1, 0, "lost")), now);
        assert!(has_defect(&step, "unknown_chat"));
        assert_eq!(engine.store().message_count(CHAT), 0);

        let step = intent(&mut engine, 1, Intent::OpenChat { chat_id: CHAT }, now);
        assert_eq!(
            outcome(&step).result.as_ref().map_err(|err| err.code.as_str()),
            Err("unknown_chat")
        );
        assert_eq!(
            outcome(&step).result.as_ref().map_err(|err| err.category),
            Err(SyncErrorCategory::Rejected)
        );
    }

    #[test]
    fn double_resolution_is_a_defect() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        let id = open(&mut engine, now);

        respond(&mut engine, id, page(&[1]), now);
        let step = respond(&mut engine, id, page(&[1]), now);
        assert!(has_defect(&step, "request_already_resolved"));
        let step = respond(&mut engine, RequestId(999), page(&[1]), now);
        assert!(has_defect(&step, "request_never_issued"));
    }

    #[test]
    fn last_message_jump_refetches_then_marks_gap() {
        let now = Instant::now();
        let mut engine = Engine::new(EngineConfig {
            page_size: 3,
            max_gap_refetches: 1,
            panic_on_defect: false,
            ..EngineConfig::default()
        });
        announce(&mut engine, now);
        let id = open(&mut engine, now);
        respond(&mut engine, id, page(&[1, 2, 3]), now);

        let mut meta = ChatMeta::new(CHAT);
        meta.last_message = Some(Some(MessageId::Remote(20)));
        let step = engine.apply_update(Update::ChatMetaChanged(meta), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Resyncing);
        let id = request_id(find_request(&step, "getChatHistory"));

        let step = respond(&mut engine, id, page(&[10, 11, 12]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Resyncing);
        let id = request_id(find_request(&step, "getChatHistory"));

        let step = respond(&mut engine, id, page(&[13, 14, 15]), now);
        assert!(step.requests.is_empty());
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
        let window = engine.store().window(CHAT).expect("window exists");
        assert!(window.gap_between(Some(3), MessageId::Remote(10)));
        assert!(window.gap_between(Some(15), MessageId::Remote(20)));
    }

    #[test]
    fn overflow_resyncs_affected_chats() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);

        let overflow = Overflow {
            chats: [CHAT].into_iter().collect(),
            chat_list_lost: true,
            dropped: 3,
            ..Overflow::default()
        };
        let step = engine.apply_overflow(&overflow, now);
        find_request(&step, "loadChats");
        find_request(&step, "getChatHistory");
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Resyncing);

        assert!(engine.apply_overflow(&Overflow::default(), now).is_empty());
    }

    #[test]
    fn failed_mark_read_restores_previous_marker() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2, 3], now);
        engine.apply_update(
            Update::ReadStateChanged {
                chat_id: CHAT,
                last_read_inbox: MessageId::Remote(1),
                unread_count: 2,
            },
            now,
        );

        let step = intent(
            &mut engine,
            5,
            Intent::MarkRead {
                chat_id: CHAT,
                message_id: MessageId::Remote(3),
            },
            now,
        );
        let request = find_request(&step, "viewMessages");
        assert_eq!(request["message_ids"], json!([3]));
        let read = |engine: &Engine| engine.store().chat(CHAT).and_then(|c| c.last_read_inbox);
        assert_eq!(read(&engine), Some(MessageId::Remote(3)));

        reject(
            &mut engine,
            request_id(request),
            SyncError::request_failed(500, "internal"),
            now,
        );
        assert_eq!(read(&engine), Some(MessageId::Remote(1)));
    }

    #[test]
    fn load_more_history_walks_back_until_exhausted() {
        let now = Instant::now();
        let mut engine = live_chat(&[7, 8, 9], now);

        let step = intent(&mut engine, 2, Intent::LoadMoreHistory { chat_id: CHAT }, now);
        let request = find_request(&step, "getChatHistory");
        assert_eq!(request["from_message_id"], 7);
        let step = respond(&mut engine, request_id(request), page(&[4, 5, 6]), now);
        assert_eq!(
            outcome(&step).result,
            Ok(OutcomeDetail::HistoryLoaded {
                chat_id: CHAT,
                count: 3,
                has_more: true,
            })
        );
        assert_eq!(timeline(&engine), remote(&[4, 5, 6, 7, 8, 9]));

        let step = intent(&mut engine, 3, Intent::LoadMoreHistory { chat_id: CHAT }, now);
        let request = find_request(&step, "getChatHistory");
        assert_eq!(request["from_message_id"], 4);
        respond(&mut engine, request_id(request), page(&[]), now);

        let step = intent(&mut engine, 4, Intent::LoadMoreHistory { chat_id: CHAT }, now);
        assert!(step.requests.is_empty());
        assert_eq!(
            outcome(&step).result,
            Ok(OutcomeDetail::HistoryLoaded {
                chat_id: CHAT,
                count: 0,
                has_more: false,
            })
        );
    }

    #[test]
    fn load_more_during_backfill_is_rejected() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        open(&mut engine, now);

        let step = intent(&mut engine, 2, Intent::LoadMoreHistory { chat_id: CHAT }, now);
        assert!(step.requests.is_empty());
        assert_eq!(
            outcome(&step).result.as_ref().map_err(|err| err.code.as_str()),
            Err("invalid_state_transition")
        );
    }

    #[test]
    fn failed_page_is_retried_on_tick() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        let id = open(&mut engine, now);

        let step = reject(
            &mut engine,
            id,
            SyncError::request_failed(429, "Too Many Requests: retry after 2"),
            now,
        );
        assert!(outcome(&step).result.is_err());
        assert!(engine.tick(now + Duration::from_secs(1)).requests.is_empty());

        let step = engine.tick(now + Duration::from_secs(2));
        let id = request_id(find_request(&step, "getChatHistory"));
        respond(&mut engine, id, page(&[1]), now);
        assert_eq!(engine.chat_state(CHAT), ChatSyncState::Live);
    }

    #[test]
    fn download_slots_are_distinct_and_released() {
        let now = Instant::now();
        let mut engine = engine();

        let first = intent(&mut engine, 1, Intent::DownloadFile { file_id: FileId(100) }, now);
        assert_eq!(find_request(&first, "downloadFile")["priority"], 2);
        let second = intent(&mut engine, 2, Intent::DownloadFile { file_id: FileId(101) }, now);
        assert_eq!(find_request(&second, "downloadFile")["priority"], 3);

        engine.apply_update(
            Update::FileUpdated(FileState {
                id: FileId(100),
                expected_size: 10,
                downloaded_size: 10,
                local_path: Some("/tmp/a".to_owned()),
                downloading: false,
            }),
            now,
        );
        assert_eq!(engine.download_priority(FileId(100)), None);

        let third = intent(&mut engine, 3, Intent::DownloadFile { file_id: FileId(102) }, now);
        assert_eq!(find_request(&third, "downloadFile")["priority"], 2);

        let again = intent(&mut engine, 4, Intent::DownloadFile { file_id: FileId(100) }, now);
        assert!(again.requests.is_empty());
        assert_eq!(outcome(&again).result, Ok(OutcomeDetail::Done));
    }

    #[test]
    fn typing_indicator_expires_on_tick() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);

        engine.apply_update(
            Update::TypingChanged {
                chat_id: CHAT,
                user_id: UserId(2),
                typing: true,
            },
            now,
        );
        assert_eq!(engine.typing_users(CHAT).collect::<Vec<_>>(), vec![UserId(2)]);

        assert!(engine.tick(now + Duration::from_secs(1)).changes.is_empty());
        let step = engine.tick(now + Duration::from_secs(7));
        assert!(step.changes.contains(&Change::ChatList));
        assert_eq!(engine.typing_users(CHAT).count(), 0);
    }

    #[test]
    fn user_change_touches_open_timelines() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let step = engine.apply_update(
            Update::UserChanged(UserPatch {
                user_id: UserId(2),
                display_name: Some("Ada".to_owned()),
                presence: None,
            }),
            now,
        );
        assert!(step.changes.contains(&Change::Timeline(CHAT)));
        assert!(step.changes.contains(&Change::ChatList));
    }

    #[test]
    fn chat_list_loads_until_backend_reports_the_end() {
        let now = Instant::now();
        let mut engine = engine();
        let step = engine.start(now);
        let id = request_id(find_request(&step, "loadChats"));

        announce(&mut engine, now);
        let step = respond(&mut engine, id, json!({"@type": "ok"}), now);
        let id = request_id(find_request(&step, "loadChats"));

        let step = reject(&mut engine, id, SyncError::request_failed(404, "Not Found"), now);
        assert!(step.requests.is_empty());
        assert!(engine.last_error().is_none());
        assert_eq!(engine.pending_requests(), 0);
    }

    fn frame(raw: Value) -> Update {
        normalize(&raw)
            .into_update()
            .unwrap_or_else(|| panic!("frame should normalize: {raw}"))
    }

    fn pending_json(id: i64, body: &str) -> Value {
        let mut message = message_json(id, body);
        message["sender_id"]["user_id"] = json!(1);
        message["sending_state"] = json!({"@type": "messageSendingStatePending", "sending_id": 0});
        message
    }

    fn send(engine: &mut Engine, ticket: u64, now: Instant) -> RequestId {
        let step = intent(
            engine,
            ticket,
            Intent::SendMessage {
                chat_id: CHAT,
                text: "hi".to_owned(),
            },
            now,
        );
        request_id(find_request(&step, "sendMessage"))
    }

    fn media_json(id: i64, album: &str) -> Value {
        let mut message = message_json(id, "");
        message["media_album_id"] = json!(album);
        message["content"] = json!({
            "@type": "messagePhoto",
            "photo": {"sizes": [{"photo": {"id": id, "size": 10, "local": {}}}]},
            "caption": {"text": ""}
        });
        message
    }

    fn file_state(id: i32, downloaded: u64, downloading: bool) -> FileState {
        FileState {
            id: FileId(id),
            expected_size: 10,
            downloaded_size: downloaded,
            local_path: (downloaded == 10).then(|| format!("/tmp/{id}")),
            downloading,
        }
    }

    #[test]
    fn pending_send_is_confirmed_under_its_server_id() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let local = MessageId::Local(LocalId(0));
        let id = send(&mut engine, 7, now);

        let temporary = 1_048_577;
        let step = respond(&mut engine, id, pending_json(temporary, "hi"), now);
        assert_eq!(step.outcomes().count(), 0);
        let step = engine.apply_update(
            frame(json!({"@type": "updateNewMessage", "message": pending_json(temporary, "hi")})),
            now,
        );
        assert!(step.is_empty());
        assert_eq!(timeline(&engine), vec![MessageId::Remote(1), local]);
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::PendingLocal)
        );

        let mut confirmed = message_json(2, "hi");
        confirmed["sender_id"]["user_id"] = json!(1);
        let step = engine.apply_update(
            frame(json!({
                "@type": "updateMessageSendSucceeded",
                "old_message_id": temporary,
                "message": confirmed,
            })),
            now,
        );
        assert_eq!(
            outcome(&step).result,
            Ok(OutcomeDetail::Sent {
                local_id: LocalId(0),
                assigned: MessageId::Remote(2),
            })
        );
        assert_eq!(timeline(&engine), remote(&[1, 2]));
        assert!(!engine.store().has_message(CHAT, MessageId::Remote(temporary)));
        assert_eq!(
            engine
                .store()
                .message(CHAT, MessageId::Remote(2))
                .map(|m| m.send_state),
            Some(SendState::Sent)
        );
    }

    #[test]
    fn server_rejected_send_can_be_dismissed() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let local = MessageId::Local(LocalId(0));
        let id = send(&mut engine, 7, now);
        respond(&mut engine, id, pending_json(1_048_578, "hi"), now);

        let step = engine.apply_update(
            frame(json!({
                "@type": "updateMessageSendFailed",
                "old_message_id": 1_048_578,
                "error": {"@type": "error", "code": 403, "message": "CHAT_WRITE_FORBIDDEN"},
                "message": pending_json(1_048_578, "hi"),
            })),
            now,
        );
        assert_eq!(outcome(&step).ticket, IntentTicket(7));
        assert_eq!(
            outcome(&step).result.as_ref().map_err(|err| err.code.as_str()),
            Err("backend_error_403")
        );
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::Failed)
        );

        let step = intent(
            &mut engine,
            8,
            Intent::DismissFailedSend {
                message_id: LocalId(0),
            },
            now,
        );
        assert_eq!(outcome(&step).result, Ok(OutcomeDetail::Done));
        assert_eq!(timeline(&engine), remote(&[1]));
    }

    #[test]
    fn late_pending_answer_still_confirms_the_row() {
        let now = Instant::now();
        let mut engine = live_chat(&[1], now);
        let local = MessageId::Local(LocalId(0));
        let id = send(&mut engine, 7, now);
        engine.tick(now + Duration::from_secs(6));

        respond(&mut engine, id, pending_json(1_048_579, "hi"), now);
        assert_eq!(
            engine.store().message(CHAT, local).map(|m| m.send_state),
            Some(SendState::PendingLocal)
        );
        let step = engine.apply_update(
            Update::MessageSendSucceeded {
                old_id: 1_048_579,
                message: text(2, 0, "hi"),
            },
            now,
        );
        assert_eq!(step.outcomes().count(), 0);
        assert_eq!(timeline(&engine), remote(&[1, 2]));
    }

    #[test]
    fn announced_chat_survives_a_full_queue() {
        let now = Instant::now();
        let mut engine = engine();
        let mut queue = IngressQueue::new(1);
        queue.push(EngineInput::Update(Update::ChatAnnounced(ChatMeta::new(CHAT))));
        queue.push(EngineInput::Update(Update::MessageAdded(text(1, 0, "first"))));

        let drained = queue.drain();
        assert!(engine.apply_overflow(&drained.overflow, now).is_empty());
        for input in drained.inputs {
            let step = engine.handle(input, now);
            assert!(!has_defect(&step, "unknown_chat"));
        }
        assert!(engine.store().has_message(CHAT, MessageId::Remote(1)));
    }

    #[test]
    fn unannounced_chat_after_overflow_waits_for_chat_list() {
        let now = Instant::now();
        let mut engine = engine();
        let overflow = Overflow {
            chat_list_lost: true,
            dropped: 1,
            ..Overflow::default()
        };
        let step = engine.apply_overflow(&overflow, now);
        let load = request_id(find_request(&step, "loadChats"));

        let step = engine.apply_update(Update::MessageAdded(text(1, 0, "early")), now);
        assert!(step.events.is_empty());

        reject(&mut engine, load, SyncError::request_failed(404, "Not Found"), now);
        let step = engine.apply_update(Update::MessageAdded(text(2, 0, "stray")), now);
        assert!(has_defect(&step, "unknown_chat"));
    }

    #[test]
    fn shed_file_completion_is_recovered_by_refresh() {
        let now = Instant::now();
        let mut engine = engine();
        intent(&mut engine, 1, Intent::DownloadFile { file_id: FileId(9) }, now);
        assert_eq!(engine.download_priority(FileId(9)), Some(2));

        let overflow = Overflow {
            files: [FileId(9)].into_iter().collect(),
            users: [UserId(2)].into_iter().collect(),
            dropped: 2,
            ..Overflow::default()
        };
        let step = engine.apply_overflow(&overflow, now);
        let refresh = find_request(&step, "getFile");
        assert_eq!(refresh["file_id"], 9);
        let user = request_id(find_request(&step, "getUser"));

        respond(
            &mut engine,
            request_id(refresh),
            json!({
                "@type": "file", "id": 9, "size": 10,
                "local": {"path": "/tmp/9", "downloaded_size": 10, "is_downloading_active": false}
            }),
            now,
        );
        assert_eq!(engine.download_priority(FileId(9)), None);
        assert!(engine.store().file(FileId(9)).is_some_and(FileState::completed));

        respond(
            &mut engine,
            user,
            json!({"@type": "user", "id": 2, "first_name": "Ada", "last_name": ""}),
            now,
        );
        assert_eq!(
            engine.store().users().get(UserId(2)).map(|u| u.display_name.as_str()),
            Some("Ada")
        );
    }

    #[test]
    fn stopped_download_frees_its_slot() {
        let now = Instant::now();
        let mut engine = engine();
        intent(&mut engine, 1, Intent::DownloadFile { file_id: FileId(9) }, now);

        engine.apply_update(Update::FileUpdated(file_state(9, 0, false)), now);
        assert_eq!(engine.download_priority(FileId(9)), Some(2));
        engine.apply_update(Update::FileUpdated(file_state(9, 4, true)), now);
        assert_eq!(engine.download_priority(FileId(9)), Some(2));
        engine.apply_update(Update::FileUpdated(file_state(9, 4, false)), now);
        assert_eq!(engine.download_priority(FileId(9)), None);
    }

    #[test]
    fn deleting_one_album_part_deletes_the_album() {
        let now = Instant::now();
        let mut engine = engine();
        announce(&mut engine, now);
        let id = open(&mut engine, now);
        let messages = vec![
            media_json(4, "0"),
            media_json(3, "77"),
            media_json(2, "77"),
        ];
        respond(
            &mut engine,
            id,
            json!({"@type": "messages", "total_count": 3, "messages": messages}),
            now,
        );
        assert_eq!(
            engine
                .store()
                .message(CHAT, MessageId::Remote(2))
                .map(|m| m.content.album_id()),
            Some(Some(77))
        );

        let step = intent(
            &mut engine,
            2,
            Intent::DeleteMessages {
                chat_id: CHAT,
                message_ids: remote(&[3]),
                revoke: true,
            },
            now,
        );
        let request = find_request(&step, "deleteMessages");
        assert_eq!(request["message_ids"], json!([2, 3]));
        respond(&mut engine, request_id(request), json!({"@type": "ok"}), now);
        assert_eq!(body(&engine, MessageId::Remote(2)), "message deleted");
        assert!(matches!(
            engine.store().message(CHAT, MessageId::Remote(4)).map(|m| &m.content),
            Some(MessageContent::Media {
                kind: MediaKind::Photo,
                ..
            })
        ));
    }

    #[test]
    fn deleting_a_local_copy_resets_the_file() {
        let now = Instant::now();
        let mut engine = engine();
        engine.apply_update(Update::FileUpdated(file_state(5, 10, false)), now);

        let step = intent(&mut engine, 3, Intent::DeleteLocalFile { file_id: FileId(5) }, now);
        let request = find_request(&step, "deleteFile");
        assert_eq!(request["file_id"], 5);
        let step = respond(&mut engine, request_id(request), json!({"@type": "ok"}), now);

        assert_eq!(outcome(&step).result, Ok(OutcomeDetail::Done));
        let file = engine.store().file(FileId(5)).expect("file stays known");
        assert_eq!(file.downloaded_size, 0);
        assert_eq!(file.local_path, None);
    }

    #[test]
    fn chat_order_is_stable_across_non_position_updates() {
        let now = Instant::now();
        let mut engine = live_chat(&[1, 2], now);
        for (id, pinned, order) in [(20, false, 50), (30, true, 1), (40, false, 50)] {
            let mut meta = ChatMeta::new(ChatId(id));
            meta.position = Some(ChatPosition { pinned, order });
            engine.apply_update(Update::ChatAnnounced(meta), now);
        }
        let order = |engine: &Engine| -> Vec<ChatId> {
            engine.store().reorder_chats().map(|chat| chat.id).collect()
        };
        let before = order(&engine);
        assert_eq!(before, vec![ChatId(30), ChatId(40), ChatId(20), CHAT]);

        for chat_id in before.clone() {
            let mut meta = ChatMeta::new(chat_id);
            meta.title = Some(format!("renamed {chat_id}"));
            meta.unread_count = Some(3);
            meta.last_message = Some(Some(MessageId::Remote(2)));
            let step = engine.apply_update(Update::ChatMetaChanged(meta), now);
            assert!(step.changes.contains(&Change::ChatList));
        }
        assert_eq!(order(&engine), before);
    }
}
