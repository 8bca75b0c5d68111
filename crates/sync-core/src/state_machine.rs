use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Synchronization phase of one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatSyncState {
    /// Nothing requested yet. Message updates reach the store but no window.
    Uninitialized,
    /// First history page requested; live updates are buffered.
    BackfillInFlight,
    /// Window is current; live updates apply directly.
    Live,
    /// Live delivery was interrupted; waiting for a fresh page.
    Resyncing,
}

#[derive(Debug, Clone)]
pub struct ChatStateMachine {
    state: ChatSyncState,
}

impl Default for ChatStateMachine {
    fn default() -> Self {
        Self {
            state: ChatSyncState::Uninitialized,
        }
    }
}

impl ChatStateMachine {
    pub fn state(&self) -> ChatSyncState {
        self.state
    }

    /// Live message updates must be held back until the page lands.
    pub fn buffers_live_updates(&self) -> bool {
        matches!(
            self.state,
            ChatSyncState::BackfillInFlight | ChatSyncState::Resyncing
        )
    }

    pub fn begin_backfill(&mut self) -> Result<ChatSyncState, SyncError> {
        self.transition_from_state(
            ChatSyncState::Uninitialized,
            ChatSyncState::BackfillInFlight,
            "begin_backfill",
        )
    }

    /// The latest page was applied and no gap remains.
    pub fn page_applied(&mut self) -> Result<ChatSyncState, SyncError> {
        self.transition_from_any_of(
            &[ChatSyncState::BackfillInFlight, ChatSyncState::Resyncing],
            ChatSyncState::Live,
            "page_applied",
        )
    }

    /// Transport loss, overflow or a detected gap. Returns the new state when
    /// the chat actually moved.
    pub fn interrupt(&mut self) -> Option<ChatSyncState> {
        match self.state {
            ChatSyncState::Live | ChatSyncState::BackfillInFlight => {
                self.state = ChatSyncState::Resyncing;
                Some(self.state)
            }
            ChatSyncState::Uninitialized | ChatSyncState::Resyncing => None,
        }
    }

    /// A closed chat that lost its page returns to the cold state; its
    /// window is rebuilt on the next open.
    pub fn abandon(&mut self) -> Result<ChatSyncState, SyncError> {
        self.transition_from_any_of(
            &[ChatSyncState::BackfillInFlight, ChatSyncState::Resyncing],
            ChatSyncState::Uninitialized,
            "abandon",
        )
    }

    fn transition_from_state(
        &mut self,
        expected: ChatSyncState,
        next: ChatSyncState,
        action: &str,
    ) -> Result<ChatSyncState, SyncError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected_states: &[ChatSyncState],
        next: ChatSyncState,
        action: &str,
    ) -> Result<ChatSyncState, SyncError> {
        if !expected_states.contains(&self.state) {
            return Err(SyncError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
