//! Per-conversation busy-lock.
//!
//! At most one generation may write to a conversation at a time. The lock
//! is a registry of busy conversation ids; acquiring hands out a
//! [`BusyGuard`] that releases the id when dropped, whichever way the
//! generation ends.

use parley_core::ConversationId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of conversations with a generation in flight.
#[derive(Debug, Clone, Default)]
pub struct ConversationLocks {
    busy: Arc<Mutex<HashSet<ConversationId>>>,
}

impl ConversationLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the conversation busy, or returns `None` if it already is.
    #[must_use]
    pub fn try_acquire(&self, id: ConversationId) -> Option<BusyGuard> {
        if !lock(&self.busy).insert(id) {
            return None;
        }
        Some(BusyGuard {
            id,
            busy: Arc::clone(&self.busy),
        })
    }

    #[must_use]
    pub fn is_busy(&self, id: ConversationId) -> bool {
        lock(&self.busy).contains(&id)
    }
}

/// Holds a conversation busy until dropped.
#[derive(Debug)]
pub struct BusyGuard {
    id: ConversationId,
    busy: Arc<Mutex<HashSet<ConversationId>>>,
}

impl BusyGuard {
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.id
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        lock(&self.busy).remove(&self.id);
    }
}

// The set stays consistent even if a holder panicked mid-insert.
fn lock(busy: &Mutex<HashSet<ConversationId>>) -> MutexGuard<'_, HashSet<ConversationId>> {
    busy.lock().unwrap_or_else(PoisonError::into_inner)
}
