use std::collections::BTreeMap;

use crate::types::FileId;

/// Lowest download priority handed out; lower values are left to the backend.
pub const MIN_PRIORITY: u8 = 2;
/// Highest download priority accepted by the backend.
pub const MAX_PRIORITY: u8 = 32;

/// Download priority slots. Each running download holds one distinct
/// priority in `2..=32`; the earliest request gets the lowest free one.
#[derive(Debug, Clone, Default)]
pub struct DownloadSlots {
    by_priority: BTreeMap<u8, FileId>,
}

impl DownloadSlots {
    /// Priority held by `file_id`, or the lowest free slot. `None` when all
    /// slots are taken.
    pub fn acquire(&mut self, file_id: FileId) -> Option<u8> {
        if let Some(priority) = self.priority_of(file_id) {
            return Some(priority);
        }
        let free = (MIN_PRIORITY..=MAX_PRIORITY).find(|slot| !self.by_priority.contains_key(slot))?;
        self.by_priority.insert(free, file_id);
        Some(free)
    }

    pub fn release(&mut self, file_id: FileId) -> Option<u8> {
        let priority = self.priority_of(file_id)?;
        self.by_priority.remove(&priority);
        Some(priority)
    }

    pub fn priority_of(&self, file_id: FileId) -> Option<u8> {
        self.by_priority
            .iter()
            .find_map(|(priority, file)| (*file == file_id).then_some(*priority))
    }

    pub fn active(&self) -> usize {
        self.by_priority.len()
    }
}
