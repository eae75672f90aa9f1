use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

#[derive(Default)]
struct SessionSlot {
    // touched only while the registry mutex is held
    users: AtomicUsize,
    gate: AsyncMutex<()>,
}

/// Per-session exclusivity registry.
///
/// `run_exclusive` guarantees that for a given session id no two futures
/// execute concurrently, and that futures run in call order (the tokio mutex
/// queues waiters FIFO). Slots are removed once their last user departs, so
/// the registry never grows with dead sessions. A failing or panicking future
/// does not poison the session for later callers.
#[derive(Default)]
pub struct SessionLocks {
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_exclusive<F, T>(&self, session_id: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = self.checkout(session_id);
        let output = {
            let _guard = slot.gate.lock().await;
            debug!(session_id, "session lock acquired");
            work.await
        };
        self.checkin(session_id, &slot);
        output
    }

    /// Number of sessions currently holding or awaiting the lock.
    pub fn active_sessions(&self) -> usize {
        self.slots.lock().expect("session lock registry poisoned").len()
    }

    fn checkout(&self, session_id: &str) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().expect("session lock registry poisoned");
        let slot = slots
            .entry(session_id.to_string())
            .or_default()
            .clone();
        slot.users.fetch_add(1, Ordering::Relaxed);
        slot
    }

    fn checkin(&self, session_id: &str, slot: &Arc<SessionSlot>) {
        let mut slots = self.slots.lock().expect("session lock registry poisoned");
        if slot.users.fetch_sub(1, Ordering::Relaxed) == 1 {
            slots.remove(session_id);
        }
    }
}
