//! Append-only store for [`StreamingLog`] entries.
//!
//! Consecutive identical entries (same tag and payload) collapse into one
//! stored entry with an incremented repeat counter, and the store keeps at
//! most `max_entries` entries, evicting the oldest first. Subscribing the
//! store to a session's event bus captures the full frame log.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::events::{Event, EventHandler, StreamingLog};

pub const DEFAULT_MAX_ENTRIES: usize = 500;

pub struct LogStore {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<StreamingLog>,
    max_entries: usize,
}

impl LogStore {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                max_entries: max_entries.max(1),
            }),
        }
    }

    pub fn append(&self, entry: StreamingLog) {
        let mut inner = self.inner.lock().expect("Mutex should not be poisoned");

        if let Some(last) = inner.entries.back_mut()
            && last.tag == entry.tag
            && last.payload == entry.payload
        {
            last.count += 1;
            last.timestamp = entry.timestamp;
            return;
        }

        if inner.entries.len() == inner.max_entries {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    /// Snapshot of the stored entries, oldest first.
    pub fn entries(&self) -> Vec<StreamingLog> {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .entries
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("Mutex should not be poisoned")
            .entries
            .clear();
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for LogStore {
    fn handle_event(&self, event: &Event) {
        if let Event::Log(entry) = event {
            self.append(entry.clone());
        }
    }
}
