use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    Idle,
    Fetching,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSnapshot {
    pub state: FetchState,
    pub attempts: u32,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl Default for FetchSnapshot {
    fn default() -> Self {
        Self {
            state: FetchState::Idle,
            attempts: 0,
            failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlightKey {
    pub book: String,
    pub index: u32,
}

impl FlightKey {
    pub fn new(book: impl Into<String>, index: u32) -> Self {
        Self {
            book: book.into(),
            index,
        }
    }
}

#[derive(Debug, Default)]
struct FlightEntry {
    gate: Arc<Mutex<()>>,
    snapshot: FetchSnapshot,
}

/// Tracks chapter downloads per (book, canonical index). `gate` hands out the
/// mutex a caller must hold across check, fetch and persist so that two
/// requests for the same chapter never write it concurrently.
#[derive(Debug, Default)]
pub struct FlightTracker {
    inner: Arc<Mutex<HashMap<FlightKey, FlightEntry>>>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, key: &FlightKey) -> Arc<Mutex<()>> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(key.clone()).or_default().gate.clone()
    }

    pub fn mark_fetching(&self, key: &FlightKey) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let snapshot = &mut guard.entry(key.clone()).or_default().snapshot;
        snapshot.state = FetchState::Fetching;
        snapshot.attempts += 1;
    }

    pub fn mark_completed(&self, key: &FlightKey) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if let Some(entry) = guard.get_mut(key) {
            entry.snapshot.state = FetchState::Completed;
            entry.snapshot.last_error = None;
        }
    }

    pub fn mark_failed(&self, key: &FlightKey, error: impl Into<String>) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if let Some(entry) = guard.get_mut(key) {
            entry.snapshot.state = FetchState::Failed;
            entry.snapshot.failures += 1;
            entry.snapshot.last_error = Some(error.into());
        }
    }

    pub fn snapshot(&self, key: &FlightKey) -> Option<FetchSnapshot> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(key).map(|entry| entry.snapshot.clone()))
    }

    pub fn is_fetching(&self, key: &FlightKey) -> bool {
        self.snapshot(key)
            .map(|snapshot| snapshot.state == FetchState::Fetching)
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<(FlightKey, FetchSnapshot)> {
        let mut out: Vec<_> = self
            .inner
            .lock()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.snapshot.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drops idle bookkeeping for a book once it is removed from the cache.
    pub fn forget_book(&self, book: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.retain(|key, entry| key.book != book || entry.snapshot.state == FetchState::Fetching);
        }
    }
}
