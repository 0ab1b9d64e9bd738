//! Thread-safe registry of in-flight explain requests.
//!
//! Provides [`InFlightRegistry`], the single piece of shared mutable state
//! between explain calls and abort calls. Removal goes through
//! [`InFlightRegistry::claim`] so that, for a given request id, exactly one
//! of "normal completion" and "explicit cancel" takes ownership of the entry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A live request tracked by the registry.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub cancellation: CancellationToken,
    pub session_key: String,
    /// Distinguishes registrations that reuse the same request id.
    pub task_id: u64,
}

/// Thread-safe mapping from request id to its cancellation handle.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    entries: Arc<Mutex<HashMap<String, InFlightEntry>>>,
    task_sequence: Arc<AtomicU64>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `request_id`. A blank id is ignored and yields `None`. An
    /// existing entry for the same id is replaced (last writer wins).
    pub fn register(
        &self,
        request_id: &str,
        cancellation: CancellationToken,
        session_key: &str,
    ) -> Option<u64> {
        if request_id.trim().is_empty() {
            return None;
        }
        let task_id = self.task_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.entries.lock().insert(
            request_id.to_string(),
            InFlightEntry {
                cancellation,
                session_key: session_key.to_string(),
                task_id,
            },
        );
        if previous.is_some() {
            tracing::warn!(request_id, "Replacing in-flight entry for reused request id");
        }
        Some(task_id)
    }

    /// Atomically remove and return the entry. Concurrent callers race for
    /// it; exactly one observes `Some`.
    pub fn claim(&self, request_id: &str) -> Option<InFlightEntry> {
        self.entries.lock().remove(request_id)
    }

    /// Idempotent removal. Returns whether an entry was present.
    pub fn remove(&self, request_id: &str) -> bool {
        self.claim(request_id).is_some()
    }

    /// Remove the entry only if it still belongs to the registration that
    /// produced `task_id`. Returns `false` when the entry was already
    /// claimed or has been replaced by a newer registration.
    pub fn release(&self, request_id: &str, task_id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries
            .get(request_id)
            .is_some_and(|entry| entry.task_id == task_id)
        {
            entries.remove(request_id);
            true
        } else {
            false
        }
    }

    /// Claim the entry and fire its cancellation token. Returns the session
    /// key of the cancelled request.
    pub fn cancel(&self, request_id: &str) -> Option<String> {
        let entry = self.claim(request_id)?;
        entry.cancellation.cancel();
        Some(entry.session_key)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Ids currently in flight, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
