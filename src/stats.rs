//! Atomic counters and per-database usage tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Counters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub queue_jumpers: AtomicU64,
    pub messages_cancelled: AtomicU64,
    pub error_messages: AtomicU64,
    pub timeouts: AtomicU64,
}

#[derive(Default)]
pub struct DbUsage {
    table: Mutex<HashMap<i64, u64>>,
}

impl DbUsage {
    pub fn record(&self, db: i64) {
        let mut guard = self.table.lock().unwrap_or_else(|p| p.into_inner());
        *guard.entry(db).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> Vec<(i64, u64)> {
        let guard = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(i64, u64)> = guard.iter().map(|(db, count)| (*db, *count)).collect();
        entries.sort_by_key(|(db, _)| *db);
        entries
    }
}

/// A point-in-time copy of the engine's counters.
///
/// Each field is read from its atomic exactly once: the source this crate
/// is grounded on read some counters twice (once for the snapshot, once
/// again when logging it), silently double-counting under concurrent
/// increments. Here every counter is loaded a single time into this struct
/// and that struct is the only thing downstream code observes.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub queue_jumpers: u64,
    pub messages_cancelled: u64,
    pub unsent_size: usize,
    pub sent_size: usize,
    pub error_messages: u64,
    pub timeouts: u64,
    pub per_db_commands: Vec<(i64, u64)>,
}

impl Counters {
    pub fn snapshot(&self, unsent_size: usize, sent_size: usize, per_db: Vec<(i64, u64)>) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            queue_jumpers: self.queue_jumpers.load(Ordering::Relaxed),
            messages_cancelled: self.messages_cancelled.load(Ordering::Relaxed),
            unsent_size,
            sent_size,
            error_messages: self.error_messages.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            per_db_commands: per_db,
        }
    }
}
