//! Probe executors used by the pollers.
//!
//! Reachability is an ICMP echo (native socket or `ping` command); liveness
//! is an authenticated SSH handshake. Link speed detection reuses the SSH
//! session to run `ethtool` on the device.

mod link_speed;
mod ping;
mod ssh;

pub use link_speed::*;
pub use ping::*;
pub use ssh::*;

use std::time::Duration;
use thiserror::Error;

use crate::storage::DeviceCredentials;

/// Hard deadline of a single reachability probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Hard deadline of a single liveness session.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(6);
/// Deadline of one link speed detection, connection included.
pub const LINK_SPEED_TIMEOUT: Duration = Duration::from_secs(8);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Single network-reachability check against one address.
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns the round-trip time in whole milliseconds, 0 when unknown.
    async fn probe(&self, address: &str) -> Result<u32, ProbeError>;
}

/// Authenticated session handshake against one device.
#[async_trait::async_trait]
pub trait SessionProbe: Send + Sync {
    async fn check(&self, credentials: &DeviceCredentials) -> Result<(), ProbeError>;
}

/// Negotiated speed of a device's primary interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpeed {
    pub mbps: u32,
    pub interface: String,
}

/// Reads the link speed of a device over an authenticated session.
#[async_trait::async_trait]
pub trait LinkSpeedProbe: Send + Sync {
    async fn detect(&self, credentials: &DeviceCredentials) -> Result<LinkSpeed, ProbeError>;
}
