use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
};

use crate::types::{Message, MessageEdit, MessageId};

/// Hard cap on history page sizes accepted by the backend.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Starting point of a timeline walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Newest,
    Oldest,
    /// Exclusive: the walk starts next to this id.
    At(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards older messages.
    Backward,
    /// Towards newer messages.
    Forward,
}

/// Clamp a requested page size against the caller's cap. Always `1..=100`.
pub fn bounded_page_limit(requested: usize, server_cap: usize) -> usize {
    requested.max(1).min(server_cap.max(1)).min(MAX_PAGE_LIMIT)
}

/// Remote id span covered by one history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub oldest: i64,
    pub newest: i64,
    /// The page was as long as requested, so more may exist beyond it.
    pub full: bool,
}

impl PageSpan {
    pub fn from_ids(ids: impl IntoIterator<Item = i64>, requested: usize) -> Option<Self> {
        let mut count = 0;
        let mut bounds: Option<(i64, i64)> = None;
        for id in ids {
            count += 1;
            bounds = Some(match bounds {
                None => (id, id),
                Some((oldest, newest)) => (oldest.min(id), newest.max(id)),
            });
        }
        bounds.map(|(oldest, newest)| Self {
            oldest,
            newest,
            full: count >= requested,
        })
    }
}

/// The loaded, contiguous slice of a chat's history.
///
/// Materialized messages are the stored messages whose remote id falls inside
/// `[oldest, newest]`, plus local pending messages once the window exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineWindow {
    initialized: bool,
    bounds: Option<(i64, i64)>,
    gaps: BTreeSet<i64>,
    has_more_history: bool,
}

impl TimelineWindow {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn oldest(&self) -> Option<i64> {
        self.bounds.map(|(oldest, _)| oldest)
    }

    pub fn newest(&self) -> Option<i64> {
        self.bounds.map(|(_, newest)| newest)
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    /// A known hole lies between the row `previous` and the row `id`.
    /// Without a previous row only a hole right at `id` counts.
    pub fn gap_between(&self, previous: Option<i64>, id: MessageId) -> bool {
        let Some(id) = id.remote() else {
            return false;
        };
        match previous {
            Some(previous) if previous < id => self
                .gaps
                .range((Bound::Excluded(previous), Bound::Included(id)))
                .next()
                .is_some(),
            Some(_) => false,
            None => self.gaps.contains(&id),
        }
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        match id {
            MessageId::Local(_) => self.initialized,
            MessageId::Remote(id) => self
                .bounds
                .is_some_and(|(oldest, newest)| oldest <= id && id <= newest),
        }
    }

    /// Grow the window to include a newer live message.
    pub fn extend_newest(&mut self, id: i64) -> bool {
        if !self.initialized {
            return false;
        }
        match self.bounds {
            None => {
                self.bounds = Some((id, id));
                true
            }
            Some((oldest, newest)) if id > newest => {
                self.bounds = Some((oldest, id));
                true
            }
            Some(_) => false,
        }
    }

    /// Fold in an initial or resync page plus the span of the live messages
    /// buffered while it was in flight.
    pub fn absorb_latest_page(&mut self, page: Option<PageSpan>, buffered: Option<(i64, i64)>) {
        let was_initialized = self.initialized;
        self.initialized = true;

        match (page, self.bounds) {
            (Some(page), Some((oldest, newest))) => {
                if page.oldest > newest && page.full {
                    self.gaps.insert(page.oldest);
                }
                self.bounds = Some((oldest.min(page.oldest), newest.max(page.newest)));
            }
            (Some(page), None) => {
                self.bounds = Some((page.oldest, page.newest));
                self.has_more_history = true;
            }
            (None, Some(_)) => {}
            (None, None) => {
                self.bounds = buffered;
                if !was_initialized {
                    self.has_more_history = false;
                }
                return;
            }
        }

        if let Some((_, newest_buffered)) = buffered {
            self.extend_newest(newest_buffered);
        }
    }

    /// Fold in a page of messages older than `anchor`. A page with nothing
    /// older ends the history.
    pub fn absorb_older_page(&mut self, anchor: i64, page: Option<PageSpan>) {
        match page {
            Some(page) if page.oldest < anchor => {
                self.bounds = Some(match self.bounds {
                    Some((oldest, newest)) => (oldest.min(page.oldest), newest),
                    None => (page.oldest, page.newest),
                });
                self.has_more_history = true;
            }
            _ => self.has_more_history = false,
        }
    }

    /// Record a hole before the first message with id `>= before`.
    pub fn mark_gap(&mut self, before: i64) {
        self.gaps.insert(before);
    }
}

/// Live changes for one message held back while a page is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedMessage {
    pub added: Option<Message>,
    pub edit: Option<MessageEdit>,
    pub deleted: bool,
}

/// Live message updates buffered during backfill or resync, merged per id.
/// Higher revisions win and deletions dominate.
#[derive(Debug, Clone, Default)]
pub struct LiveBuffer {
    entries: BTreeMap<MessageId, BufferedMessage>,
}

impl LiveBuffer {
    pub fn push_added(&mut self, message: Message) {
        let entry = self.entries.entry(message.id).or_default();
        match &entry.added {
            Some(existing) if existing.revision >= message.revision => {}
            _ => entry.added = Some(message),
        }
    }

    pub fn push_edit(&mut self, edit: MessageEdit) {
        let entry = self.entries.entry(edit.message_id).or_default();
        match &entry.edit {
            Some(existing) if existing.revision >= edit.revision => {}
            _ => entry.edit = Some(edit),
        }
    }

    pub fn push_delete(&mut self, id: MessageId) {
        self.entries.entry(id).or_default().deleted = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remote id span of buffered new messages.
    pub fn added_span(&self) -> Option<(i64, i64)> {
        let mut ids = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.added.is_some())
            .filter_map(|(id, _)| id.remote());
        let first = ids.next()?;
        let last = ids.last().unwrap_or(first);
        Some((first, last))
    }

    /// Hand out buffered entries in id order, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = (MessageId, BufferedMessage)> {
        std::mem::take(&mut self.entries).into_iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatId, LocalId, MessageContent, SendState, UserId};

    fn message(id: i64, revision: u64, text: &str) -> Message {
        Message {
            id: MessageId::Remote(id),
            chat_id: ChatId(1),
            sender: UserId(2),
            date: 0,
            content: MessageContent::Text {
                text: text.to_owned(),
            },
            revision,
            send_state: SendState::Sent,
        }
    }

    #[test]
    fn bounds_page_limit_for_safety() {
        assert_eq!(bounded_page_limit(0, 200), 1);
        assert_eq!(bounded_page_limit(25, 10), 10);
        assert_eq!(bounded_page_limit(150, 500), 100);
    }

    #[test]
    fn initial_page_sets_bounds_and_extends_to_buffered_messages() {
        let mut window = TimelineWindow::default();
        assert!(!window.contains(MessageId::Local(LocalId(0))));

        window.absorb_latest_page(PageSpan::from_ids([10, 11, 12], 3), Some((13, 14)));
        assert_eq!(window.oldest(), Some(10));
        assert_eq!(window.newest(), Some(14));
        assert!(window.has_more_history());
        assert!(window.contains(MessageId::Remote(13)));
        assert!(!window.contains(MessageId::Remote(9)));
        assert!(window.contains(MessageId::Local(LocalId(0))));
    }

    #[test]
    fn empty_initial_page_uses_buffered_span_and_ends_history() {
        let mut window = TimelineWindow::default();
        window.absorb_latest_page(None, Some((5, 7)));
        assert_eq!(window.oldest(), Some(5));
        assert_eq!(window.newest(), Some(7));
        assert!(!window.has_more_history());
    }

    #[test]
    fn non_overlapping_full_resync_page_leaves_gap_marker() {
        let mut window = TimelineWindow::default();
        window.absorb_latest_page(PageSpan::from_ids([1, 2], 2), None);

        window.absorb_latest_page(PageSpan::from_ids([50, 51], 2), None);
        assert!(window.gap_between(Some(2), MessageId::Remote(50)));
        assert!(!window.gap_between(Some(50), MessageId::Remote(51)));
        assert_eq!(window.oldest(), Some(1));
        assert_eq!(window.newest(), Some(51));

        window.absorb_latest_page(PageSpan::from_ids([60], 2), None);
        assert_eq!(window.gap_count(), 1);
    }

    #[test]
    fn older_page_without_older_ids_clears_has_more() {
        let mut window = TimelineWindow::default();
        window.absorb_latest_page(PageSpan::from_ids([20, 21], 2), None);

        window.absorb_older_page(20, PageSpan::from_ids([15, 19], 2));
        assert_eq!(window.oldest(), Some(15));
        assert!(window.has_more_history());

        window.absorb_older_page(15, None);
        assert!(!window.has_more_history());
    }

    #[test]
    fn live_buffer_keeps_higher_revision_and_sticky_deletes() {
        let mut buffer = LiveBuffer::default();
        buffer.push_added(message(5, 2, "new"));
        buffer.push_added(message(5, 1, "old"));
        buffer.push_delete(MessageId::Remote(6));
        buffer.push_added(message(6, 0, "gone"));
        buffer.push_added(message(4, 0, "first"));

        assert_eq!(buffer.added_span(), Some((4, 6)));
        let drained: Vec<_> = buffer.drain().collect();
        assert!(buffer.is_empty());
        assert_eq!(
            drained.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![
                MessageId::Remote(4),
                MessageId::Remote(5),
                MessageId::Remote(6)
            ]
        );
        assert_eq!(
            drained[1].1.added.as_ref().map(|message| message.revision),
            Some(2)
        );
        assert!(drained[2].1.deleted);
    }
}
