use std::time::Duration;

use crate::{requests::RequestTimeouts, retry::RetryPolicy, timeline::bounded_page_limit, types::UserId};

pub const DEFAULT_INGRESS_CAPACITY: usize = 4096;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_CHAT_LIST_LIMIT: usize = 100;
pub const DEFAULT_MAX_GAP_REFETCHES: u32 = 3;
pub const DEFAULT_ORPHAN_CAP: usize = 1024;
pub const DEFAULT_EXPIRED_MEMORY: usize = 256;
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(6);
pub const DEFAULT_CHAT_ROWS: usize = 200;
pub const DEFAULT_TIMELINE_ROWS: usize = 100;

/// Tuning knobs of the synchronization engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timeouts: RequestTimeouts,
    /// Bound of the ingress queue in front of the engine actor.
    pub ingress_capacity: usize,
    /// History page size, clamped to `1..=100`.
    pub page_size: usize,
    /// `limit` of the `loadChats` request.
    pub chat_list_limit: usize,
    /// Latest-page refetches before a residual gap is marked and accepted.
    pub max_gap_refetches: u32,
    pub orphan_cap: usize,
    /// How many timed-out correlation ids are remembered for late responses.
    pub expired_memory: usize,
    pub typing_ttl: Duration,
    pub chat_rows: usize,
    pub timeline_rows: usize,
    pub retry: RetryPolicy,
    /// Sender id stamped on optimistic messages.
    pub own_user_id: UserId,
    /// Panic on invariant breaks instead of only reporting them.
    pub panic_on_defect: bool,
}

impl EngineConfig {
    pub fn page_limit(&self) -> usize {
        bounded_page_limit(self.page_size, self.page_size)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: RequestTimeouts::default(),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            chat_list_limit: DEFAULT_CHAT_LIST_LIMIT,
            max_gap_refetches: DEFAULT_MAX_GAP_REFETCHES,
            orphan_cap: DEFAULT_ORPHAN_CAP,
            expired_memory: DEFAULT_EXPIRED_MEMORY,
            typing_ttl: DEFAULT_TYPING_TTL,
            chat_rows: DEFAULT_CHAT_ROWS,
            timeline_rows: DEFAULT_TIMELINE_ROWS,
            retry: RetryPolicy::default(),
            own_user_id: UserId(0),
            panic_on_defect: cfg!(debug_assertions),
        }
    }
}
