//! Normalized entity storage: the single source of truth for chats, messages,
//! users and files.
//!
//! Every mutation is idempotent and reports whether anything changed, so the
//! engine can re-apply overlapping pages and replayed updates freely.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    ops::Bound,
};

use tracing::trace;

use crate::{
    timeline::{Anchor, Direction, TimelineWindow},
    types::{
        Chat, ChatId, ChatMeta, FileId, FileState, Message, MessageContent, MessageEdit,
        MessageId, Presence, SendState, User, UserId, UserPatch,
    },
};

/// Lazy walk over a chat's materialized messages.
pub type TimelineIter<'a> = Box<dyn Iterator<Item = &'a Message> + 'a>;

/// How an upsert landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same or older revision, or a tombstoned target.
    Unchanged,
    /// Target message unknown; kept as an orphan until it arrives.
    Parked,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatChange {
    pub changed: bool,
    pub reordered: bool,
}

/// Sort key of the chat index: pinned first, then higher order, then higher id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ChatOrderKey {
    pinned: Reverse<bool>,
    order: Reverse<i64>,
    id: Reverse<ChatId>,
}

impl ChatOrderKey {
    fn of(chat: &Chat) -> Self {
        Self {
            pinned: Reverse(chat.position.pinned),
            order: Reverse(chat.position.order),
            id: Reverse(chat.id),
        }
    }
}

/// Generation-checked handle into the user arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserRef {
    pub id: UserId,
    generation: u32,
}

#[derive(Debug, Clone)]
struct UserSlot {
    user: Option<User>,
    generation: u32,
}

/// Users keyed by id. Eviction bumps the slot generation so outstanding
/// [`UserRef`]s resolve to `None` instead of a reused entry.
#[derive(Debug, Clone, Default)]
pub struct UserArena {
    slots: HashMap<UserId, UserSlot>,
}

impl UserArena {
    pub fn upsert(&mut self, patch: &UserPatch) -> bool {
        let slot = self.slots.entry(patch.user_id).or_insert(UserSlot {
            user: None,
            generation: 0,
        });
        let user = slot.user.get_or_insert_with(|| User {
            id: patch.user_id,
            display_name: format!("user {}", patch.user_id),
            presence: Presence::Unknown,
            revision: 0,
        });

        let mut changed = user.revision == 0;
        if let Some(name) = &patch.display_name
            && *name != user.display_name
        {
            user.display_name.clone_from(name);
            changed = true;
        }
        if let Some(presence) = patch.presence
            && presence != user.presence
        {
            user.presence = presence;
            changed = true;
        }
        if changed {
            user.revision += 1;
        }
        changed
    }

    pub fn get(&self, id: UserId) -> Option<&User> {
        self.slots.get(&id).and_then(|slot| slot.user.as_ref())
    }

    pub fn handle(&self, id: UserId) -> Option<UserRef> {
        let slot = self.slots.get(&id)?;
        slot.user.as_ref().map(|_| UserRef {
            id,
            generation: slot.generation,
        })
    }

    pub fn resolve(&self, handle: UserRef) -> Option<&User> {
        self.slots
            .get(&handle.id)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.user.as_ref())
    }

    pub fn evict(&mut self, id: UserId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.user.is_some() => {
                slot.user = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|slot| slot.user.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type OrphanKey = (ChatId, MessageId);

/// Edits and deletions that arrived before their message. Past the cap the
/// earliest-parked target is forgotten first.
#[derive(Debug, Clone)]
struct Orphans {
    edits: HashMap<OrphanKey, MessageEdit>,
    deletes: HashSet<OrphanKey>,
    arrivals: BTreeMap<u64, OrphanKey>,
    arrival_of: HashMap<OrphanKey, u64>,
    next_arrival: u64,
    cap: usize,
}

impl Orphans {
    fn new(cap: usize) -> Self {
        Self {
            edits: HashMap::new(),
            deletes: HashSet::new(),
            arrivals: BTreeMap::new(),
            arrival_of: HashMap::new(),
            next_arrival: 0,
            cap: cap.max(1),
        }
    }

    fn park_edit(&mut self, edit: &MessageEdit) {
        let key = (edit.chat_id, edit.message_id);
        if self.deletes.contains(&key) {
            return;
        }
        match self.edits.get(&key) {
            Some(existing) if existing.revision >= edit.revision => {}
            _ => {
                self.edits.insert(key, edit.clone());
            }
        }
        self.track(key);
    }

    fn park_delete(&mut self, chat_id: ChatId, id: MessageId) {
        let key = (chat_id, id);
        self.edits.remove(&key);
        self.deletes.insert(key);
        self.track(key);
    }

    /// Remember the first arrival of `key`, then evict down to the cap.
    fn track(&mut self, key: OrphanKey) {
        if !self.arrival_of.contains_key(&key) {
            let seq = self.next_arrival;
            self.next_arrival += 1;
            self.arrival_of.insert(key, seq);
            self.arrivals.insert(seq, key);
        }
        while self.arrivals.len() > self.cap {
            let Some((_, oldest)) = self.arrivals.pop_first() else {
                break;
            };
            self.arrival_of.remove(&oldest);
            self.edits.remove(&oldest);
            self.deletes.remove(&oldest);
            trace!(chat_id = %oldest.0, message_id = ?oldest.1, "orphan evicted");
        }
    }

    fn forget(&mut self, key: OrphanKey) {
        if let Some(seq) = self.arrival_of.remove(&key) {
            self.arrivals.remove(&seq);
        }
        self.edits.remove(&key);
        self.deletes.remove(&key);
    }

    /// Fold parked changes into an arriving message.
    fn settle(&mut self, message: &mut Message) {
        let key = (message.chat_id, message.id);
        let deleted = self.deletes.contains(&key);
        let edit = self.edits.remove(&key);
        self.forget(key);
        if deleted {
            message.content = MessageContent::Deleted;
            return;
        }
        if let Some(edit) = edit
            && edit.revision > message.revision
        {
            let mut content = edit.content;
            content.inherit_album(&message.content);
            message.content = content;
            message.revision = edit.revision;
        }
    }

    fn len(&self) -> usize {
        self.arrivals.len()
    }
}

#[derive(Debug, Clone)]
pub struct EntityStore {
    chats: HashMap<ChatId, Chat>,
    chat_index: BTreeSet<ChatOrderKey>,
    messages: HashMap<ChatId, BTreeMap<MessageId, Message>>,
    windows: HashMap<ChatId, TimelineWindow>,
    users: UserArena,
    files: HashMap<FileId, FileState>,
    orphans: Orphans,
}

impl EntityStore {
    pub fn new(orphan_cap: usize) -> Self {
        Self {
            chats: HashMap::new(),
            chat_index: BTreeSet::new(),
            messages: HashMap::new(),
            windows: HashMap::new(),
            users: UserArena::default(),
            files: HashMap::new(),
            orphans: Orphans::new(orphan_cap),
        }
    }

    pub fn chat(&self, id: ChatId) -> Option<&Chat> {
        self.chats.get(&id)
    }

    pub fn has_chat(&self, id: ChatId) -> bool {
        self.chats.contains_key(&id)
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    /// Create the chat if needed and apply the present fields of `meta`.
    pub fn upsert_chat(&mut self, meta: &ChatMeta) -> ChatChange {
        let inserted = !self.chats.contains_key(&meta.chat_id);
        let chat = self
            .chats
            .entry(meta.chat_id)
            .or_insert_with(|| Chat::new(meta.chat_id));
        let old_key = ChatOrderKey::of(chat);
        let mut change = ChatChange {
            changed: inserted,
            reordered: inserted,
        };

        if let Some(title) = &meta.title
            && *title != chat.title
        {
            chat.title.clone_from(title);
            change.changed = true;
        }
        if let Some(position) = meta.position
            && position != chat.position
        {
            chat.position = position;
            change.changed = true;
            change.reordered = true;
        }
        if let Some(unread) = meta.unread_count
            && unread != chat.unread_count
        {
            chat.unread_count = unread;
            change.changed = true;
        }
        if let Some(read) = meta.last_read_inbox
            && chat.last_read_inbox.is_none_or(|current| read > current)
        {
            chat.last_read_inbox = Some(read);
            change.changed = true;
        }
        if let Some(last) = meta.last_message
            && last != chat.last_message
        {
            chat.last_message = last;
            change.changed = true;
        }
        if let Some(participants) = &meta.participants
            && *participants != chat.participants
        {
            chat.participants.clone_from(participants);
            change.changed = true;
        }

        if change.changed {
            chat.revision += 1;
        }
        if change.reordered {
            let new_key = ChatOrderKey::of(chat);
            self.chat_index.remove(&old_key);
            self.chat_index.insert(new_key);
            trace!(chat_id = %meta.chat_id, "chat index reordered");
        }
        change
    }

    /// Chats in display order, read from the incrementally maintained index.
    pub fn reorder_chats(&self) -> impl Iterator<Item = &Chat> + '_ {
        self.chat_index
            .iter()
            .filter_map(|key| self.chats.get(&key.id.0))
    }

    /// Monotonic read marker. The unread count follows the backend.
    pub fn set_read_state(
        &mut self,
        chat_id: ChatId,
        last_read_inbox: MessageId,
        unread_count: u32,
    ) -> bool {
        let Some(chat) = self.chats.get_mut(&chat_id) else {
            return false;
        };
        let mut changed = false;
        if chat.last_read_inbox.is_none_or(|current| last_read_inbox > current) {
            chat.last_read_inbox = Some(last_read_inbox);
            changed = true;
        }
        if chat.unread_count != unread_count {
            chat.unread_count = unread_count;
            changed = true;
        }
        if changed {
            chat.revision += 1;
        }
        changed
    }

    /// Optimistic local read marker; never moves backwards.
    pub fn advance_read_marker(&mut self, chat_id: ChatId, read: MessageId) -> bool {
        match self.chats.get_mut(&chat_id) {
            Some(chat) if chat.last_read_inbox.is_none_or(|current| read > current) => {
                chat.last_read_inbox = Some(read);
                chat.revision += 1;
                true
            }
            _ => false,
        }
    }

    /// Put back a read marker after a failed mark-read, unless something
    /// newer already moved it.
    pub fn restore_read_marker(
        &mut self,
        chat_id: ChatId,
        optimistic: MessageId,
        previous: Option<MessageId>,
    ) -> bool {
        match self.chats.get_mut(&chat_id) {
            Some(chat) if chat.last_read_inbox == Some(optimistic) => {
                chat.last_read_inbox = previous;
                chat.revision += 1;
                true
            }
            _ => false,
        }
    }

    pub fn message(&self, chat_id: ChatId, id: MessageId) -> Option<&Message> {
        self.messages.get(&chat_id).and_then(|map| map.get(&id))
    }

    pub fn has_message(&self, chat_id: ChatId, id: MessageId) -> bool {
        self.message(chat_id, id).is_some()
    }

    pub fn message_count(&self, chat_id: ChatId) -> usize {
        self.messages.get(&chat_id).map_or(0, BTreeMap::len)
    }

    /// Insert if absent; otherwise apply only a strictly newer revision.
    /// Tombstones never come back.
    pub fn upsert_message(&mut self, mut message: Message) -> UpsertOutcome {
        if let MessageContent::Media {
            file: Some(file), ..
        } = &message.content
        {
            self.files.entry(file.id).or_insert_with(|| file.clone());
        }

        let messages = self.messages.entry(message.chat_id).or_default();
        match messages.get_mut(&message.id) {
            None => {
                self.orphans.settle(&mut message);
                messages.insert(message.id, message);
                UpsertOutcome::Inserted
            }
            Some(existing) => {
                if existing.content.is_deleted() || message.revision <= existing.revision {
                    return UpsertOutcome::Unchanged;
                }
                message.content.inherit_album(&existing.content);
                existing.content = message.content;
                existing.revision = message.revision;
                UpsertOutcome::Updated
            }
        }
    }

    pub fn apply_edit(&mut self, edit: &MessageEdit) -> UpsertOutcome {
        let existing = self
            .messages
            .get_mut(&edit.chat_id)
            .and_then(|map| map.get_mut(&edit.message_id));
        match existing {
            None => {
                self.orphans.park_edit(edit);
                UpsertOutcome::Parked
            }
            Some(existing)
                if existing.content.is_deleted() || edit.revision <= existing.revision =>
            {
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                let mut content = edit.content.clone();
                content.inherit_album(&existing.content);
                existing.content = content;
                existing.revision = edit.revision;
                UpsertOutcome::Updated
            }
        }
    }

    /// Replace the content with a tombstone, keeping the position.
    pub fn tombstone(&mut self, chat_id: ChatId, id: MessageId) -> UpsertOutcome {
        let existing = self
            .messages
            .get_mut(&chat_id)
            .and_then(|map| map.get_mut(&id));
        match existing {
            None => {
                self.orphans.park_delete(chat_id, id);
                UpsertOutcome::Parked
            }
            Some(existing) if existing.content.is_deleted() => UpsertOutcome::Unchanged,
            Some(existing) => {
                existing.content = MessageContent::Deleted;
                UpsertOutcome::Updated
            }
        }
    }

    pub fn set_send_state(&mut self, chat_id: ChatId, id: MessageId, state: SendState) -> bool {
        match self
            .messages
            .get_mut(&chat_id)
            .and_then(|map| map.get_mut(&id))
        {
            Some(message) if message.send_state != state => {
                message.send_state = state;
                true
            }
            _ => false,
        }
    }

    /// Messages of `chat_id` that belong to the album `album_id`.
    pub fn album_members(
        &self,
        chat_id: ChatId,
        album_id: i64,
    ) -> impl Iterator<Item = MessageId> + '_ {
        self.messages
            .get(&chat_id)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(move |message| message.content.album_id() == Some(album_id))
            .map(|message| message.id)
    }

    pub fn remove_message(&mut self, chat_id: ChatId, id: MessageId) -> Option<Message> {
        self.messages.get_mut(&chat_id)?.remove(&id)
    }

    /// Move an optimistic message to its backend-assigned id. If the assigned
    /// id already arrived through a live update, the two entries merge.
    pub fn remap_message(&mut self, chat_id: ChatId, local: MessageId, mut assigned: Message) -> bool {
        let had_local = self.remove_message(chat_id, local).is_some();
        assigned.send_state = SendState::Sent;
        let id = assigned.id;
        self.upsert_message(assigned);
        self.set_send_state(chat_id, id, SendState::Sent);
        had_local
    }

    pub fn window(&self, chat_id: ChatId) -> Option<&TimelineWindow> {
        self.windows.get(&chat_id)
    }

    pub fn window_mut(&mut self, chat_id: ChatId) -> &mut TimelineWindow {
        self.windows.entry(chat_id).or_default()
    }

    /// Forget the window; stored messages stay.
    pub fn reset_window(&mut self, chat_id: ChatId) -> bool {
        self.windows.remove(&chat_id).is_some()
    }

    /// Walk the materialized messages of a chat from `anchor` towards
    /// `direction`, yielding at most `limit` entries. Restart with
    /// `Anchor::At(last_seen)` to continue.
    pub fn timeline_window(
        &self,
        chat_id: ChatId,
        anchor: Anchor,
        direction: Direction,
        limit: usize,
    ) -> TimelineIter<'_> {
        let (Some(messages), Some(window)) = (self.messages.get(&chat_id), self.windows.get(&chat_id))
        else {
            return Box::new(std::iter::empty());
        };
        let lower = match window.oldest() {
            Some(oldest) => Bound::Included(MessageId::Remote(oldest)),
            None => Bound::Included(MessageId::Remote(i64::MAX)),
        };

        let iter: TimelineIter<'_> = match (anchor, direction) {
            (Anchor::Newest, Direction::Backward) => {
                Box::new(messages.range((lower, Bound::Unbounded)).rev().map(|(_, m)| m))
            }
            (Anchor::Oldest, Direction::Forward) => {
                Box::new(messages.range((lower, Bound::Unbounded)).map(|(_, m)| m))
            }
            (Anchor::At(id), Direction::Backward)
                if matches!(lower, Bound::Included(lower) if lower >= id) =>
            {
                Box::new(std::iter::empty())
            }
            (Anchor::At(id), Direction::Backward) => Box::new(
                messages
                    .range((lower, Bound::Excluded(id)))
                    .rev()
                    .map(|(_, m)| m),
            ),
            (Anchor::At(id), Direction::Forward) => {
                let start = match lower {
                    Bound::Included(lower) if lower > id => Bound::Included(lower),
                    _ => Bound::Excluded(id),
                };
                Box::new(messages.range((start, Bound::Unbounded)).map(|(_, m)| m))
            }
            (Anchor::Newest, Direction::Forward) | (Anchor::Oldest, Direction::Backward) => {
                Box::new(std::iter::empty())
            }
        };
        Box::new(
            iter.filter(move |message| window.contains(message.id))
                .take(limit),
        )
    }

    pub fn users(&self) -> &UserArena {
        &self.users
    }

    pub fn upsert_user(&mut self, patch: &UserPatch) -> bool {
        self.users.upsert(patch)
    }

    pub fn evict_user(&mut self, id: UserId) -> bool {
        self.users.evict(id)
    }

    pub fn file(&self, id: FileId) -> Option<&FileState> {
        self.files.get(&id)
    }

    pub fn upsert_file(&mut self, file: FileState) -> bool {
        match self.files.get(&file.id) {
            Some(existing) if *existing == file => false,
            _ => {
                self.files.insert(file.id, file);
                true
            }
        }
    }

    /// Forget the downloaded copy of a file after the backend deleted it.
    pub fn clear_local_file(&mut self, id: FileId) -> bool {
        match self.files.get_mut(&id) {
            Some(file)
                if file.downloaded_size > 0 || file.local_path.is_some() || file.downloading =>
            {
                file.downloaded_size = 0;
                file.local_path = None;
                file.downloading = false;
                true
            }
            _ => false,
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        timeline::PageSpan,
        types::{ChatPosition, LocalId, MediaKind},
    };

    fn text(chat: i64, id: i64, revision: u64, body: &str) -> Message {
        Message {
            id: MessageId::Remote(id),
            chat_id: ChatId(chat),
            sender: UserId(9),
            date: id,
            content: MessageContent::Text {
                text: body.to_owned(),
            },
            revision,
            send_state: SendState::Sent,
        }
    }

    fn body(store: &EntityStore, chat: i64, id: i64) -> MessageContent {
        store
            .message(ChatId(chat), MessageId::Remote(id))
            .expect("message should exist")
            .content
            .clone()
    }

    fn positioned(chat: i64, pinned: bool, order: i64) -> ChatMeta {
        let mut meta = ChatMeta::new(ChatId(chat));
        meta.position = Some(ChatPosition { pinned, order });
        meta
    }

    #[test]
    fn upsert_is_idempotent_and_revision_gated() {
        let mut store = EntityStore::new(16);
        assert_eq!(store.upsert_message(text(1, 10, 0, "a")), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_message(text(1, 10, 0, "a")), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert_message(text(1, 10, 2, "b")), UpsertOutcome::Updated);
        assert_eq!(store.upsert_message(text(1, 10, 1, "stale")), UpsertOutcome::Unchanged);
        assert_eq!(
            body(&store, 1, 10),
            MessageContent::Text {
                text: "b".to_owned()
            }
        );
    }

    #[test]
    fn edit_before_message_is_parked_and_applied_on_arrival() {
        let mut store = EntityStore::new(16);
        let edit = MessageEdit {
            chat_id: ChatId(1),
            message_id: MessageId::Remote(10),
            content: MessageContent::Text {
                text: "edited".to_owned(),
            },
            revision: 5,
        };
        assert_eq!(store.apply_edit(&edit), UpsertOutcome::Parked);
        assert_eq!(store.orphan_count(), 1);

        store.upsert_message(text(1, 10, 0, "original"));
        assert_eq!(
            body(&store, 1, 10),
            MessageContent::Text {
                text: "edited".to_owned()
            }
        );
        assert_eq!(store.orphan_count(), 0);
    }

    #[test]
    fn edit_original_delete_in_any_order_ends_as_tombstone() {
        let edit = MessageEdit {
            chat_id: ChatId(1),
            message_id: MessageId::Remote(10),
            content: MessageContent::Text {
                text: "edited".to_owned(),
            },
            revision: 3,
        };
        type Step = fn(&mut EntityStore, &MessageEdit);
        let original: Step = |store, _| {
            store.upsert_message(text(1, 10, 0, "original"));
        };
        let edited: Step = |store, edit| {
            store.apply_edit(edit);
        };
        let deleted: Step = |store, _| {
            store.tombstone(ChatId(1), MessageId::Remote(10));
        };
        let orders: [[Step; 3]; 6] = [
            [original, edited, deleted],
            [original, deleted, edited],
            [edited, original, deleted],
            [edited, deleted, original],
            [deleted, original, edited],
            [deleted, edited, original],
        ];

        for order in orders {
            let mut store = EntityStore::new(16);
            for step in order {
                step(&mut store, &edit);
            }
            assert_eq!(body(&store, 1, 10), MessageContent::Deleted);
        }
    }

    #[test]
    fn orphans_are_bounded() {
        let mut store = EntityStore::new(2);
        for id in 0..5 {
            store.tombstone(ChatId(1), MessageId::Remote(id));
        }
        assert_eq!(store.orphan_count(), 2);
    }

    #[test]
    fn orphan_eviction_follows_arrival_not_id() {
        let mut store = EntityStore::new(2);
        for id in [50, 10, 30] {
            store.tombstone(ChatId(1), MessageId::Remote(id));
        }
        assert_eq!(store.orphan_count(), 2);

        store.upsert_message(text(1, 10, 0, "late"));
        store.upsert_message(text(1, 50, 0, "kept"));
        assert_eq!(body(&store, 1, 10), MessageContent::Deleted);
        assert_eq!(
            body(&store, 1, 50),
            MessageContent::Text {
                text: "kept".to_owned()
            }
        );
        assert_eq!(store.orphan_count(), 1);
    }

    #[test]
    fn edits_keep_album_and_album_members_are_listed() {
        let mut store = EntityStore::new(16);
        for id in [20, 21, 22] {
            store.upsert_message(Message {
                content: MessageContent::Media {
                    kind: MediaKind::Photo,
                    caption: None,
                    duration: None,
                    album_id: (id != 22).then_some(7),
                    file: None,
                },
                ..text(1, id, 0, "")
            });
        }
        store.apply_edit(&MessageEdit {
            chat_id: ChatId(1),
            message_id: MessageId::Remote(21),
            content: MessageContent::Media {
                kind: MediaKind::Photo,
                caption: Some("new caption".to_owned()),
                duration: None,
                album_id: None,
                file: None,
            },
            revision: 2,
        });

        let members: Vec<_> = store.album_members(ChatId(1), 7).collect();
        assert_eq!(members, vec![MessageId::Remote(20), MessageId::Remote(21)]);
        assert_eq!(store.album_members(ChatId(2), 7).count(), 0);
    }

    #[test]
    fn clearing_a_local_file_resets_progress() {
        let mut store = EntityStore::new(16);
        store.upsert_file(FileState {
            id: FileId(3),
            expected_size: 10,
            downloaded_size: 10,
            local_path: Some("/tmp/clip.mp4".to_owned()),
            downloading: false,
        });
        assert!(store.clear_local_file(FileId(3)));
        let file = store.file(FileId(3)).expect("file stays known");
        assert_eq!((file.downloaded_size, file.local_path.as_deref()), (0, None));
        assert!(!store.clear_local_file(FileId(3)));
        assert!(!store.clear_local_file(FileId(4)));
    }

    #[test]
    fn chat_index_stays_sorted_under_position_changes() {
        let mut store = EntityStore::new(16);
        store.upsert_chat(&positioned(1, false, 100));
        store.upsert_chat(&positioned(2, false, 300));
        store.upsert_chat(&positioned(3, true, 5));
        store.upsert_chat(&positioned(4, false, 300));

        let order: Vec<_> = store.reorder_chats().map(|chat| chat.id.0).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);

        let change = store.upsert_chat(&positioned(1, false, 400));
        assert!(change.reordered);
        let order: Vec<_> = store.reorder_chats().map(|chat| chat.id.0).collect();
        assert_eq!(order, vec![3, 1, 4, 2]);

        let mut title_only = ChatMeta::new(ChatId(2));
        title_only.title = Some("renamed".to_owned());
        let change = store.upsert_chat(&title_only);
        assert!(change.changed);
        assert!(!change.reordered);
        assert!(!store.upsert_chat(&title_only).changed);
    }

    #[test]
    fn read_marker_never_moves_backwards() {
        let mut store = EntityStore::new(16);
        store.upsert_chat(&ChatMeta::new(ChatId(1)));
        assert!(store.set_read_state(ChatId(1), MessageId::Remote(20), 0));
        store.set_read_state(ChatId(1), MessageId::Remote(10), 4);
        let chat = store.chat(ChatId(1)).expect("chat exists");
        assert_eq!(chat.last_read_inbox, Some(MessageId::Remote(20)));
        assert_eq!(chat.unread_count, 4);
    }

    #[test]
    fn remap_merges_with_already_arrived_live_message() {
        let mut store = EntityStore::new(16);
        let local = MessageId::Local(LocalId(0));
        store.upsert_message(Message {
            id: local,
            send_state: SendState::PendingLocal,
            ..text(1, 0, 0, "hi")
        });
        store.upsert_message(text(1, 77, 1, "hi"));

        assert!(store.remap_message(ChatId(1), local, text(1, 77, 0, "hi")));
        assert_eq!(store.message_count(ChatId(1)), 1);
        let merged = store
            .message(ChatId(1), MessageId::Remote(77))
            .expect("merged message");
        assert_eq!(merged.send_state, SendState::Sent);
        assert_eq!(merged.revision, 1);
    }

    #[test]
    fn timeline_window_walks_materialized_messages_lazily() {
        let mut store = EntityStore::new(16);
        for id in [5, 10, 11, 12, 13] {
            store.upsert_message(text(1, id, 0, "x"));
        }
        store.upsert_message(Message {
            id: MessageId::Local(LocalId(3)),
            send_state: SendState::PendingLocal,
            ..text(1, 0, 0, "pending")
        });
        store
            .window_mut(ChatId(1))
            .absorb_latest_page(PageSpan::from_ids([10, 11, 12, 13], 4), None);

        let newest: Vec<_> = store
            .timeline_window(ChatId(1), Anchor::Newest, Direction::Backward, 3)
            .map(|message| message.id)
            .collect();
        assert_eq!(
            newest,
            vec![
                MessageId::Local(LocalId(3)),
                MessageId::Remote(13),
                MessageId::Remote(12)
            ]
        );

        let older: Vec<_> = store
            .timeline_window(
                ChatId(1),
                Anchor::At(MessageId::Remote(12)),
                Direction::Backward,
                10,
            )
            .map(|message| message.id)
            .collect();
        assert_eq!(older, vec![MessageId::Remote(11), MessageId::Remote(10)]);

        let forward: Vec<_> = store
            .timeline_window(ChatId(1), Anchor::Oldest, Direction::Forward, 2)
            .map(|message| message.id)
            .collect();
        assert_eq!(forward, vec![MessageId::Remote(10), MessageId::Remote(11)]);

        assert_eq!(
            store
                .timeline_window(ChatId(2), Anchor::Newest, Direction::Backward, 10)
                .count(),
            0
        );
    }

    #[test]
    fn evicted_user_handles_resolve_to_none() {
        let mut store = EntityStore::new(16);
        let patch = UserPatch {
            user_id: UserId(4),
            display_name: Some("Ada".to_owned()),
            presence: None,
        };
        assert!(store.upsert_user(&patch));
        assert!(!store.upsert_user(&patch));
        let handle = store.users().handle(UserId(4)).expect("user handle");
        assert_eq!(
            store.users().resolve(handle).map(|user| user.display_name.as_str()),
            Some("Ada")
        );

        assert!(store.evict_user(UserId(4)));
        assert!(store.users().resolve(handle).is_none());
        store.upsert_user(&patch);
        assert!(store.users().resolve(handle).is_none());
        assert!(store.users().get(UserId(4)).is_some());
    }
}
