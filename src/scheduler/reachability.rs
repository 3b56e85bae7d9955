//! Reachability poller: periodic ping fan-out with per-device throttling.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::types::{any_ping_enabled, effective_interval, Device, MonitoringPolicy, ReachabilityFailure, ReachabilityResult};
use super::wake::{wake_channel, WakeReceiver, WakeSender};
use super::{emit, EventLog};
use crate::probe::{ProbeError, ReachabilityProbe, PING_TIMEOUT};
use crate::storage::LogLevel;

/// Maximum number of pings in flight at once.
pub const PING_CONCURRENCY: usize = 8;

/// How often a disabled loop re-checks its policy.
const DISABLED_RECHECK: Duration = Duration::from_secs(1);

const SOURCE: &str = "ping";

struct TargetSet {
    devices: Vec<Device>,
    policy: MonitoringPolicy,
}

/// A published result plus the monotonic cycle time it was taken under.
#[derive(Clone)]
struct Checked {
    result: ReachabilityResult,
    cycle_at: Instant,
}

struct Inner {
    targets: RwLock<TargetSet>,
    results: RwLock<HashMap<String, Checked>>,
    /// Serializes cycles so a device never has two probes in flight.
    cycle: Mutex<()>,
    wake: WakeSender,
    prober: Arc<dyn ReachabilityProbe>,
    probe_timeout: Duration,
    log: Option<Arc<dyn EventLog>>,
}

/// Owns the reachability target set, policy and result cache.
pub struct ReachabilityPoller {
    inner: Arc<Inner>,
    wake_rx: StdMutex<Option<WakeReceiver>>,
}

impl ReachabilityPoller {
    pub fn new(prober: Arc<dyn ReachabilityProbe>, log: Option<Arc<dyn EventLog>>) -> Self {
        let (wake, wake_rx) = wake_channel();
        Self {
            inner: Arc::new(Inner {
                targets: RwLock::new(TargetSet {
                    devices: Vec::new(),
                    policy: MonitoringPolicy::default(),
                }),
                results: RwLock::new(HashMap::new()),
                cycle: Mutex::new(()),
                wake,
                prober,
                probe_timeout: PING_TIMEOUT,
                log,
            }),
            wake_rx: StdMutex::new(Some(wake_rx)),
        }
    }

    /// Override the per-probe deadline. Only valid before `start`.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.probe_timeout = timeout;
        }
        self
    }

    /// Spawn the background loop. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let wake_rx = self.wake_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(wake_rx) = wake_rx else {
            tracing::warn!("Reachability poller already started");
            return None;
        };
        tracing::info!("Starting reachability poller");
        Some(tokio::spawn(run_loop(self.inner.clone(), wake_rx)))
    }

    /// Replace targets and policy in one step. The enabled flag is derived
    /// from the new targets, whatever the policy says.
    pub async fn update_from_board(&self, devices: Vec<Device>, policy: MonitoringPolicy) {
        self.inner.replace(Some(devices), Some(policy.sanitized())).await;
        self.inner.wake.signal();
    }

    /// Replace the target set only.
    pub async fn update_targets(&self, devices: Vec<Device>) {
        self.inner.replace(Some(devices), None).await;
        self.inner.wake.signal();
    }

    /// Apply a new policy. Invalid intervals are sanitized, `enabled` is
    /// recomputed from the current targets.
    pub async fn set_policy(&self, policy: MonitoringPolicy) {
        self.inner.replace(None, Some(policy.sanitized())).await;
        self.inner.wake.signal();
    }

    pub async fn policy(&self) -> MonitoringPolicy {
        self.inner.targets.read().await.policy
    }

    /// Snapshot of the latest result per device.
    pub async fn results(&self) -> HashMap<String, ReachabilityResult> {
        self.inner
            .results
            .read()
            .await
            .iter()
            .map(|(id, checked)| (id.clone(), checked.result.clone()))
            .collect()
    }

    /// Run one probe cycle now, regardless of the timer.
    pub async fn run_cycle(&self) {
        self.inner.run_cycle(Instant::now()).await;
    }
}

impl Inner {
    /// Swap in targets and/or policy, recompute `enabled`, and drop cached
    /// results of devices no longer present.
    async fn replace(&self, devices: Option<Vec<Device>>, policy: Option<MonitoringPolicy>) {
        let mut targets = self.targets.write().await;
        if let Some(devices) = devices {
            targets.devices = devices;
        }
        if let Some(policy) = policy {
            targets.policy = policy;
        }
        targets.policy.enabled = any_ping_enabled(&targets.devices);

        let ids: HashSet<&str> = targets.devices.iter().map(|d| d.id.as_str()).collect();
        self.results.write().await.retain(|id, _| ids.contains(id.as_str()));
    }

    async fn is_enabled(&self) -> bool {
        self.targets.read().await.policy.enabled
    }

    /// One probe cycle. `cycle_at` is the tick the cycle belongs to; the
    /// throttle compares these ticks, so a device whose interval equals the
    /// timer period is probed on every tick.
    async fn run_cycle(&self, cycle_at: Instant) {
        let _cycle = self.cycle.lock().await;

        let (devices, policy) = {
            let targets = self.targets.read().await;
            (targets.devices.clone(), targets.policy)
        };
        let previous: HashMap<String, Instant> = self
            .results
            .read()
            .await
            .iter()
            .map(|(id, checked)| (id.clone(), checked.cycle_at))
            .collect();

        let mut fresh: HashMap<String, ReachabilityResult> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(PING_CONCURRENCY));
        let mut probes = JoinSet::new();

        for device in &devices {
            let Some(host) = device.as_host() else {
                continue;
            };
            if !host.ping_enabled || !seen.insert(device.id.as_str()) {
                continue;
            }

            if let Some(last) = previous.get(&device.id) {
                if cycle_at.saturating_duration_since(*last) < effective_interval(host, &policy) {
                    continue;
                }
            }

            let Some(address) = host.addresses.pick() else {
                fresh.insert(device.id.clone(), ReachabilityResult::no_ip(Utc::now()));
                emit(
                    self.log.as_deref(),
                    LogLevel::Warn,
                    SOURCE,
                    &format!("ping skipped for {}: no ip", device.id),
                );
                continue;
            };

            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let timeout = self.probe_timeout;
            let id = device.id.clone();
            let address = address.to_string();

            probes.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = probe_address(prober.as_ref(), &address, timeout).await;
                (id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, result)) => {
                    self.log_result(&id, &result);
                    fresh.insert(id, result);
                }
                Err(e) => tracing::error!("Ping task failed: {}", e),
            }
        }

        self.merge(fresh, cycle_at).await;
    }

    /// Publish a cycle's results in one critical section.
    async fn merge(&self, fresh: HashMap<String, ReachabilityResult>, cycle_at: Instant) {
        let targets = self.targets.read().await;
        let ids: HashSet<&str> = targets.devices.iter().map(|d| d.id.as_str()).collect();

        let mut results = self.results.write().await;
        results.extend(
            fresh
                .into_iter()
                .filter(|(id, _)| ids.contains(id.as_str()))
                .map(|(id, result)| (id, Checked { result, cycle_at })),
        );
        results.retain(|id, _| ids.contains(id.as_str()));
    }

    fn log_result(&self, id: &str, result: &ReachabilityResult) {
        let level = if result.online {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let error = result.error.map(|e| e.as_str()).unwrap_or_default();
        emit(
            self.log.as_deref(),
            level,
            SOURCE,
            &format!(
                "ping {} -> online={} rtt={}ms error={}",
                id, result.online, result.rtt_ms, error
            ),
        );
    }
}

/// Probe one address under a hard deadline and classify the outcome.
async fn probe_address(prober: &dyn ReachabilityProbe, address: &str, timeout: Duration) -> ReachabilityResult {
    let checked = Utc::now();
    match tokio::time::timeout(timeout, prober.probe(address)).await {
        Ok(Ok(rtt_ms)) => ReachabilityResult::online(checked, address, rtt_ms),
        Ok(Err(ProbeError::Timeout(_))) | Err(_) => {
            ReachabilityResult::offline(checked, address, ReachabilityFailure::Timeout)
        }
        Ok(Err(e)) => {
            tracing::debug!("Ping {} failed: {}", address, e);
            ReachabilityResult::offline(checked, address, ReachabilityFailure::Unreachable)
        }
    }
}

/// Background loop: idle while disabled, otherwise wait for the interval
/// timer or a wake and run a cycle.
async fn run_loop(inner: Arc<Inner>, mut wake: WakeReceiver) {
    let mut ticker: Option<(tokio::time::Interval, Duration)> = None;

    loop {
        let policy = inner.targets.read().await.policy;

        if !policy.enabled {
            ticker = None;
            tokio::select! {
                open = wake.recv() => {
                    if !open {
                        break;
                    }
                    if inner.is_enabled().await {
                        inner.run_cycle(Instant::now()).await;
                    }
                }
                _ = tokio::time::sleep(DISABLED_RECHECK) => {}
            }
            continue;
        }

        let period = policy.interval();
        if ticker.as_ref().map_or(true, |(_, current)| *current != period) {
            tracing::info!("Reachability poller interval set to {:?}", period);
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker = Some((timer, period));
        }
        let Some((timer, _)) = ticker.as_mut() else {
            continue;
        };

        tokio::select! {
            tick = timer.tick() => inner.run_cycle(tick).await,
            open = wake.recv() => {
                if !open {
                    break;
                }
                if inner.is_enabled().await {
                    inner.run_cycle(Instant::now()).await;
                }
            }
        }
    }

    tracing::info!("Reachability poller stopped");
}
