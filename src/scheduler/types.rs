//! Typed device descriptors, monitoring policy and status results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval used when the policy carries none (or an invalid one).
pub const DEFAULT_INTERVAL_SECS: i64 = 30;
pub const MIN_INTERVAL_SECS: i64 = 5;
pub const MAX_INTERVAL_SECS: i64 = 3600;

/// A monitorable entry of the board, decoded once per refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
}

/// Segments group hosts on the canvas and are never probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Host(HostSpec),
    Segment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSpec {
    pub addresses: Addresses,
    pub ping_enabled: bool,
    /// Per-device override of the global interval, in seconds.
    pub ping_interval_secs: Option<i64>,
    pub liveness_enabled: bool,
}

/// Candidate addresses of a host. Empty strings are normalized to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addresses {
    pub public: Option<String>,
    pub private: Option<String>,
    pub overlay: Option<String>,
}

impl Device {
    pub fn host(id: impl Into<String>, spec: HostSpec) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::Host(spec),
        }
    }

    pub fn segment(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::Segment,
        }
    }

    pub fn as_host(&self) -> Option<&HostSpec> {
        match &self.kind {
            DeviceKind::Host(spec) => Some(spec),
            DeviceKind::Segment => None,
        }
    }

    pub fn as_host_mut(&mut self) -> Option<&mut HostSpec> {
        match &mut self.kind {
            DeviceKind::Host(spec) => Some(spec),
            DeviceKind::Segment => None,
        }
    }

    pub fn ping_enabled(&self) -> bool {
        self.as_host().is_some_and(|h| h.ping_enabled)
    }

    pub fn liveness_enabled(&self) -> bool {
        self.as_host().is_some_and(|h| h.liveness_enabled)
    }
}

impl Addresses {
    pub fn new(public: Option<&str>, private: Option<&str>, overlay: Option<&str>) -> Self {
        Self {
            public: normalize(public),
            private: normalize(private),
            overlay: normalize(overlay),
        }
    }

    /// Probe target by priority: public, then private, then overlay.
    pub fn pick(&self) -> Option<&str> {
        [&self.public, &self.private, &self.overlay]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|addr| !addr.is_empty())
    }
}

fn normalize(addr: Option<&str>) -> Option<String> {
    addr.map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
}

/// True iff at least one device in the set has reachability polling on.
pub fn any_ping_enabled(devices: &[Device]) -> bool {
    devices.iter().any(Device::ping_enabled)
}

/// Global monitoring policy of the reachability poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringPolicy {
    /// Derived from the target set; ignored on input.
    pub enabled: bool,
    pub interval_sec: i64,
    /// UI hint only.
    pub show_status: bool,
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: DEFAULT_INTERVAL_SECS,
            show_status: false,
        }
    }
}

impl MonitoringPolicy {
    /// Replace invalid intervals with the default.
    ///
    /// A zero interval also restores the default `show_status` when the caller
    /// set neither flag. Values outside `[5, 3600]` reset to the default rather
    /// than clamping to the nearest bound.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.interval_sec == 0 {
            if !self.enabled && !self.show_status {
                self.show_status = defaults.show_status;
            }
            self.interval_sec = defaults.interval_sec;
        }
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.interval_sec) {
            self.interval_sec = defaults.interval_sec;
        }
        self
    }

    pub fn interval(&self) -> Duration {
        let secs = if self.interval_sec > 0 {
            self.interval_sec
        } else {
            DEFAULT_INTERVAL_SECS
        };
        Duration::from_secs(secs as u64)
    }
}

/// Device override if positive, else the policy interval, else the default.
pub fn effective_interval(spec: &HostSpec, policy: &MonitoringPolicy) -> Duration {
    let secs = spec
        .ping_interval_secs
        .filter(|s| *s > 0)
        .or(Some(policy.interval_sec).filter(|s| *s > 0))
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    Duration::from_secs(secs as u64)
}

/// Why a reachability probe did not report the device online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachabilityFailure {
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "unreachable")]
    Unreachable,
    #[serde(rename = "no ip")]
    NoIp,
}

impl ReachabilityFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::NoIp => "no ip",
        }
    }
}

impl std::fmt::Display for ReachabilityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest reachability state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityResult {
    pub online: bool,
    pub last_checked: DateTime<Utc>,
    /// 0 when unknown.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rtt_ms: u32,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReachabilityFailure>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ReachabilityResult {
    pub fn online(checked: DateTime<Utc>, target: &str, rtt_ms: u32) -> Self {
        Self {
            online: true,
            last_checked: checked,
            rtt_ms,
            target: target.to_string(),
            error: None,
        }
    }

    pub fn offline(checked: DateTime<Utc>, target: &str, failure: ReachabilityFailure) -> Self {
        Self {
            online: false,
            last_checked: checked,
            rtt_ms: 0,
            target: target.to_string(),
            error: Some(failure),
        }
    }

    pub fn no_ip(checked: DateTime<Utc>) -> Self {
        Self::offline(checked, "", ReachabilityFailure::NoIp)
    }
}

/// Latest SSH liveness state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessResult {
    pub online: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LivenessResult {
    pub fn online(checked: DateTime<Utc>) -> Self {
        Self {
            online: true,
            last_checked: checked,
            error: None,
        }
    }

    pub fn failed(checked: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            online: false,
            last_checked: checked,
            error: Some(error.into()),
        }
    }
}
