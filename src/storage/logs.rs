//! Bounded in-memory event log shown in the UI.

use chrono::{SecondsFormat, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use super::models::{LogEntry, LogLevel};
use crate::scheduler::EventLog;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// FIFO ring of the most recent events; the oldest entry is evicted when full.
pub struct LogStore {
    capacity: usize,
    items: Mutex<VecDeque<LogEntry>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_LOG_CAPACITY
        } else {
            capacity
        };
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn add(&self, level: LogLevel, source: &str, message: &str) {
        let entry = LogEntry {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level,
            source: source.to_string(),
            message: message.to_string(),
        };
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(entry);
    }

    /// The newest `limit` entries, oldest first. A zero or oversized limit returns all.
    pub fn list(&self, limit: usize) -> Vec<LogEntry> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = if limit == 0 || limit > items.len() {
            items.len()
        } else {
            limit
        };
        items.iter().skip(items.len() - limit).cloned().collect()
    }
}

impl EventLog for LogStore {
    fn append(&self, level: LogLevel, source: &str, message: &str) {
        self.add(level, source, message);
    }
}
