//! Liveness poller: fixed-cadence SSH login checks.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::types::{Addresses, Device, LivenessResult};
use super::wake::{wake_channel, WakeReceiver, WakeSender};
use super::{emit, CredentialResolver, EventLog};
use crate::probe::{SessionProbe, SESSION_TIMEOUT};
use crate::storage::LogLevel;

/// Maximum number of SSH sessions in flight at once.
pub const SESSION_CONCURRENCY: usize = 6;

/// Fixed cadence of liveness cycles.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

const SOURCE: &str = "ssh";

struct Inner {
    targets: RwLock<Vec<Device>>,
    results: RwLock<HashMap<String, LivenessResult>>,
    cycle: Mutex<()>,
    wake: WakeSender,
    prober: Arc<dyn SessionProbe>,
    credentials: Arc<dyn CredentialResolver>,
    session_timeout: Duration,
    log: Option<Arc<dyn EventLog>>,
}

/// Owns the liveness target set and result cache.
pub struct LivenessPoller {
    inner: Arc<Inner>,
    wake_rx: StdMutex<Option<WakeReceiver>>,
}

impl LivenessPoller {
    pub fn new(
        prober: Arc<dyn SessionProbe>,
        credentials: Arc<dyn CredentialResolver>,
        log: Option<Arc<dyn EventLog>>,
    ) -> Self {
        let (wake, wake_rx) = wake_channel();
        Self {
            inner: Arc::new(Inner {
                targets: RwLock::new(Vec::new()),
                results: RwLock::new(HashMap::new()),
                cycle: Mutex::new(()),
                wake,
                prober,
                credentials,
                session_timeout: SESSION_TIMEOUT,
                log,
            }),
            wake_rx: StdMutex::new(Some(wake_rx)),
        }
    }

    /// Override the per-session deadline. Only valid before `start`.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.session_timeout = timeout;
        }
        self
    }

    /// Spawn the background loop. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let wake_rx = self.wake_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(wake_rx) = wake_rx else {
            tracing::warn!("Liveness poller already started");
            return None;
        };
        tracing::info!("Starting liveness poller");
        Some(tokio::spawn(run_loop(self.inner.clone(), wake_rx)))
    }

    /// Replace the target set and wake the loop.
    pub async fn update_targets(&self, devices: Vec<Device>) {
        {
            let mut targets = self.inner.targets.write().await;
            *targets = devices;
            let ids: HashSet<&str> = targets.iter().map(|d| d.id.as_str()).collect();
            self.inner
                .results
                .write()
                .await
                .retain(|id, _| ids.contains(id.as_str()));
        }
        self.inner.wake.signal();
    }

    /// Snapshot of the latest result per device.
    pub async fn results(&self) -> HashMap<String, LivenessResult> {
        self.inner.results.read().await.clone()
    }

    /// Run one check cycle now, regardless of the timer.
    pub async fn run_cycle(&self) {
        self.inner.run_cycle().await;
    }
}

impl Inner {
    async fn run_cycle(&self) {
        let _cycle = self.cycle.lock().await;

        let devices = self.targets.read().await.clone();
        let mut seen: HashSet<&str> = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(SESSION_CONCURRENCY));
        let mut checks = JoinSet::new();

        for device in &devices {
            let Some(host) = device.as_host() else {
                continue;
            };
            if !host.liveness_enabled || !seen.insert(device.id.as_str()) {
                continue;
            }

            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let credentials = self.credentials.clone();
            let timeout = self.session_timeout;
            let id = device.id.clone();
            let addresses = host.addresses.clone();

            checks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = check_device(prober, credentials, &id, &addresses, timeout).await;
                (id, result)
            });
        }

        let mut fresh: HashMap<String, LivenessResult> = HashMap::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    self.log_result(&id, &result);
                    fresh.insert(id, result);
                }
                Err(e) => tracing::error!("SSH check task failed: {}", e),
            }
        }

        let targets = self.targets.read().await;
        let ids: HashSet<&str> = targets.iter().map(|d| d.id.as_str()).collect();
        let mut results = self.results.write().await;
        results.extend(fresh.into_iter().filter(|(id, _)| ids.contains(id.as_str())));
        results.retain(|id, _| ids.contains(id.as_str()));
    }

    fn log_result(&self, id: &str, result: &LivenessResult) {
        let level = if result.online {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let error = result.error.as_deref().unwrap_or_default();
        emit(
            self.log.as_deref(),
            level,
            SOURCE,
            &format!("ssh {} -> online={} error={}", id, result.online, error),
        );
    }
}

/// Resolve credentials and attempt one authenticated session.
async fn check_device(
    prober: Arc<dyn SessionProbe>,
    credentials: Arc<dyn CredentialResolver>,
    id: &str,
    addresses: &Addresses,
    timeout: Duration,
) -> LivenessResult {
    let checked = Utc::now();

    let lookup_id = id.to_string();
    let lookup = tokio::task::spawn_blocking(move || credentials.lookup(&lookup_id)).await;
    let mut settings = match lookup {
        Ok(Ok(Some(settings))) => settings,
        Ok(Ok(None)) => return LivenessResult::failed(checked, "settings not found"),
        Ok(Err(e)) => return LivenessResult::failed(checked, e.to_string()),
        Err(e) => return LivenessResult::failed(checked, format!("credential lookup failed: {}", e)),
    };

    if settings.host.trim().is_empty() {
        settings.host = addresses.pick().unwrap_or_default().to_string();
    }

    match tokio::time::timeout(timeout, prober.check(&settings)).await {
        Ok(Ok(())) => LivenessResult::online(checked),
        Ok(Err(e)) => LivenessResult::failed(checked, e.to_string()),
        Err(_) => LivenessResult::failed(checked, format!("session timed out after {:?}", timeout)),
    }
}

/// Background loop: a cycle on every timer tick and on every wake.
async fn run_loop(inner: Arc<Inner>, mut wake: WakeReceiver) {
    let mut timer = tokio::time::interval_at(Instant::now() + LIVENESS_INTERVAL, LIVENESS_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => inner.run_cycle().await,
            open = wake.recv() => {
                if !open {
                    break;
                }
                inner.run_cycle().await;
            }
        }
    }

    tracing::info!("Liveness poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use crate::scheduler::testing::Gauge;
    use crate::scheduler::HostSpec;
    use crate::storage::{DeviceCredentials, StorageError};

    struct FakeSession {
        gauge: Arc<Gauge>,
        delay: Duration,
        seen_hosts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SessionProbe for FakeSession {
        async fn check(&self, credentials: &DeviceCredentials) -> Result<(), ProbeError> {
            self.seen_hosts.lock().unwrap().push(credentials.host.clone());
            let result = if credentials.host.is_empty() {
                Err(ProbeError::Config("host is empty".into()))
            } else if credentials.password == "wrong" {
                Err(ProbeError::Auth("admin rejected by server".into()))
            } else {
                Ok(())
            };
            self.gauge.measure(&credentials.username, self.delay, result).await
        }
    }

    /// Credentials keyed by device id; ids starting with `broken` fail to load.
    #[derive(Default)]
    struct FakeVault {
        items: HashMap<String, DeviceCredentials>,
    }

    impl CredentialResolver for FakeVault {
        fn lookup(&self, device_id: &str) -> Result<Option<DeviceCredentials>, StorageError> {
            if device_id.starts_with("broken") {
                return Err(StorageError::Crypto("decryption failed".into()));
            }
            Ok(self.items.get(device_id).cloned())
        }
    }

    fn creds(host: &str, username: &str, password: &str) -> DeviceCredentials {
        DeviceCredentials {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            connect_enabled: true,
            ..Default::default()
        }
    }

    fn watched(id: &str, address: Option<&str>) -> Device {
        Device::host(
            id,
            HostSpec {
                addresses: Addresses::new(None, address, None),
                liveness_enabled: true,
                ..Default::default()
            },
        )
    }

    fn poller(vault: FakeVault, delay: Duration) -> (LivenessPoller, Arc<FakeSession>) {
        let session = Arc::new(FakeSession {
            gauge: Arc::new(Gauge::default()),
            delay,
            seen_hosts: Default::default(),
        });
        let poller = LivenessPoller::new(session.clone(), Arc::new(vault), None);
        (poller, session)
    }

    #[tokio::test]
    async fn test_check_outcomes() {
        let mut vault = FakeVault::default();
        vault.items.insert("ok".into(), creds("10.0.0.1", "a", "pw"));
        vault.items.insert("denied".into(), creds("10.0.0.2", "b", "wrong"));
        vault.items.insert("nohost".into(), creds("", "c", "pw"));
        let (poller, _) = poller(vault, Duration::ZERO);

        poller
            .update_targets(vec![
                watched("ok", None),
                watched("denied", None),
                watched("missing", Some("10.0.0.3")),
                watched("broken-1", Some("10.0.0.4")),
                watched("nohost", None),
            ])
            .await;
        poller.run_cycle().await;

        let results = poller.results().await;
        assert!(results["ok"].online);
        assert_eq!(results["ok"].error, None);

        assert!(!results["denied"].online);
        assert_eq!(
            results["denied"].error.as_deref(),
            Some("authentication failed: admin rejected by server")
        );

        assert_eq!(results["missing"].error.as_deref(), Some("settings not found"));
        assert_eq!(results["broken-1"].error.as_deref(), Some("crypto error: decryption failed"));
        assert_eq!(
            results["nohost"].error.as_deref(),
            Some("invalid configuration: host is empty")
        );
    }

    #[tokio::test]
    async fn test_host_falls_back_to_device_address() {
        let mut vault = FakeVault::default();
        vault.items.insert("srv".into(), creds(" ", "a", "pw"));
        let (poller, session) = poller(vault, Duration::ZERO);

        poller.update_targets(vec![watched("srv", Some("10.0.0.7"))]).await;
        poller.run_cycle().await;

        assert!(poller.results().await["srv"].online);
        assert_eq!(*session.seen_hosts.lock().unwrap(), vec!["10.0.0.7".to_string()]);
    }

    #[tokio::test]
    async fn test_skips_segments_and_disabled() {
        let mut vault = FakeVault::default();
        vault.items.insert("off".into(), creds("10.0.0.1", "a", "pw"));
        let (poller, session) = poller(vault, Duration::ZERO);

        let mut off = watched("off", None);
        off.as_host_mut().unwrap().liveness_enabled = false;
        poller.update_targets(vec![Device::segment("lan"), off]).await;
        poller.run_cycle().await;

        assert!(poller.results().await.is_empty());
        assert_eq!(session.gauge.calls(), 0);
    }

    #[tokio::test]
    async fn test_every_cycle_rechecks() {
        let mut vault = FakeVault::default();
        vault.items.insert("ok".into(), creds("10.0.0.1", "a", "pw"));
        let (poller, session) = poller(vault, Duration::ZERO);
        poller.update_targets(vec![watched("ok", None)]).await;

        poller.run_cycle().await;
        poller.run_cycle().await;

        assert_eq!(session.gauge.calls(), 2);
    }

    #[tokio::test]
    async fn test_session_deadline() {
        let mut vault = FakeVault::default();
        vault.items.insert("slow".into(), creds("10.0.0.1", "a", "pw"));
        let (poller, _) = poller(vault, Duration::from_millis(500));
        let poller = poller.with_session_timeout(Duration::from_millis(20));
        poller.update_targets(vec![watched("slow", None)]).await;

        poller.run_cycle().await;

        let results = poller.results().await;
        assert!(!results["slow"].online);
        assert!(results["slow"].error.as_deref().unwrap().starts_with("session timed out"));
    }

    #[tokio::test]
    async fn test_removed_devices_are_pruned() {
        let mut vault = FakeVault::default();
        vault.items.insert("a".into(), creds("10.0.0.1", "a", "pw"));
        vault.items.insert("b".into(), creds("10.0.0.2", "b", "pw"));
        let (poller, _) = poller(vault, Duration::ZERO);

        poller.update_targets(vec![watched("a", None), watched("b", None)]).await;
        poller.run_cycle().await;
        assert_eq!(poller.results().await.len(), 2);

        poller.update_targets(vec![watched("a", None)]).await;
        poller.run_cycle().await;

        let results = poller.results().await;
        assert!(results.contains_key("a"));
        assert!(!results.contains_key("b"));
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let mut vault = FakeVault::default();
        let devices = (0..20)
            .map(|i| {
                let id = format!("d{}", i);
                vault.items.insert(id.clone(), creds("10.0.0.1", &format!("user{}", i), "pw"));
                watched(&id, None)
            })
            .collect();
        let (poller, session) = poller(vault, Duration::from_millis(50));
        poller.update_targets(devices).await;

        poller.run_cycle().await;

        assert_eq!(session.gauge.calls(), 20);
        assert!(session.gauge.peak() <= SESSION_CONCURRENCY, "peak {}", session.gauge.peak());
        assert!(session.gauge.peak() > 1);
        assert_eq!(session.gauge.peak_per_key(), 1);
    }

    #[tokio::test]
    async fn test_loop_runs_cycle_on_wake() {
        let mut vault = FakeVault::default();
        vault.items.insert("ok".into(), creds("10.0.0.1", "a", "pw"));
        let (poller, _) = poller(vault, Duration::ZERO);
        assert!(poller.start().is_some());

        poller.update_targets(vec![watched("ok", None)]).await;

        let deadline = Instant::now() + Duration::from_secs(3);
        while poller.results().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(poller.results().await["ok"].online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_cadence() {
        let mut vault = FakeVault::default();
        vault.items.insert("ok".into(), creds("10.0.0.1", "a", "pw"));
        let (poller, session) = poller(vault, Duration::ZERO);
        let start = Instant::now();
        poller.start();
        poller.update_targets(vec![watched("ok", None)]).await;

        tokio::time::sleep_until(start + Duration::from_secs(29)).await;
        assert_eq!(session.gauge.calls(), 1);

        tokio::time::sleep_until(start + Duration::from_millis(30_500)).await;
        assert_eq!(session.gauge.calls(), 2);
        tokio::time::sleep_until(start + Duration::from_millis(60_500)).await;
        assert_eq!(session.gauge.calls(), 3);
    }
}
