// Intercessio Engine — Activity Log
// Bounded in-memory ring of recent events for the dashboard. Newest first,
// capacity 200, nothing persisted — loss on restart is fine.

use crate::atoms::constants::ACTIVITY_CAPACITY;
use crate::atoms::types::{ActivityEntry, ActivityKind, now_ms};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Default)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        ActivityLog {
            entries: Mutex::new(VecDeque::with_capacity(ACTIVITY_CAPACITY)),
        }
    }

    /// Stamp id/timestamp when absent, push to the front, drop from the back.
    pub fn record(&self, mut entry: ActivityEntry) {
        if entry.id.is_empty() {
            entry.id = uuid::Uuid::new_v4().to_string();
        }
        if entry.timestamp == 0 {
            entry.timestamp = now_ms();
        }
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        while entries.len() > ACTIVITY_CAPACITY {
            entries.pop_back();
        }
    }

    /// Convenience for the common shape: kind + summary + session context.
    pub fn push(
        &self,
        kind: ActivityKind,
        summary: impl Into<String>,
        session: Option<(&str, &str)>,
        client: Option<&str>,
    ) {
        self.record(ActivityEntry {
            id: String::new(),
            timestamp: 0,
            kind,
            summary: summary.into(),
            session_id: session.map(|(id, _)| id.to_string()),
            session_label: session.map(|(_, label)| label.to_string()),
            client: client.map(|c| c.to_string()),
            metadata: None,
        });
    }

    /// Snapshot, newest first.
    pub fn list(&self) -> Vec<ActivityEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
