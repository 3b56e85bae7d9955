//! Monitoring core: reachability and liveness pollers.
//!
//! Each poller owns one background loop, its target set and a latest-only
//! result cache. Board edits push whole target sets in; the HTTP layer reads
//! snapshots out. The two pollers share no state.

mod liveness;
mod reachability;
mod types;
mod wake;

pub use liveness::*;
pub use reachability::*;
pub use types::*;
pub use wake::*;

use crate::storage::{DeviceCredentials, LogLevel, StorageError};

/// Sink for user-visible monitoring events. Must not block the caller.
pub trait EventLog: Send + Sync {
    fn append(&self, level: LogLevel, source: &str, message: &str);
}

/// Source of per-device connection settings for the liveness poller.
pub trait CredentialResolver: Send + Sync {
    fn lookup(&self, device_id: &str) -> Result<Option<DeviceCredentials>, StorageError>;
}

/// Trace an event and forward it to the event log, if one is attached.
pub(crate) fn emit(log: Option<&dyn EventLog>, level: LogLevel, source: &str, message: &str) {
    match level {
        LogLevel::Info => tracing::info!(source, "{}", message),
        LogLevel::Warn => tracing::warn!(source, "{}", message),
        LogLevel::Error => tracing::error!(source, "{}", message),
    }
    if let Some(log) = log {
        log.append(level, source, message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Instrumented fakes shared by the poller tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::EventLog;
    use crate::storage::LogLevel;

    /// Tracks concurrent entries overall and per key.
    #[derive(Default)]
    pub struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        per_key: Mutex<HashMap<String, (usize, usize)>>,
    }

    impl Gauge {
        pub async fn measure<T>(&self, key: &str, delay: Duration, result: T) -> T {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            {
                let mut per_key = self.per_key.lock().unwrap();
                let entry = per_key.entry(key.to_string()).or_default();
                entry.0 += 1;
                entry.1 = entry.1.max(entry.0);
            }

            tokio::time::sleep(delay).await;

            self.per_key.lock().unwrap().get_mut(key).unwrap().0 -= 1;
            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }

        pub fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn peak_per_key(&self) -> usize {
            self.per_key.lock().unwrap().values().map(|(_, peak)| *peak).max().unwrap_or(0)
        }
    }

    #[derive(Default)]
    pub struct MemoryLog {
        pub entries: Mutex<Vec<(LogLevel, String, String)>>,
    }

    impl EventLog for MemoryLog {
        fn append(&self, level: LogLevel, source: &str, message: &str) {
            self.entries
                .lock()
                .unwrap()
                .push((level, source.to_string(), message.to_string()));
        }
    }
}
