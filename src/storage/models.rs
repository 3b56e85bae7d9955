//! JSON models persisted by the storage collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::scheduler::{Addresses, Device, HostSpec, MonitoringPolicy};

/// Node type reserved for network segments.
pub const SEGMENT_TYPE: &str = "network";

/// One entry of the board's `nodes` array. Only monitoring fields are decoded;
/// layout fields stay in the raw board file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BoardNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub ip_private: Option<String>,
    pub ip_tailscale: Option<String>,
    pub ip_public: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_enabled: Option<bool>,
    pub ping_interval_sec: i64,
    pub connect_enabled: bool,
}

impl BoardNode {
    pub fn to_device(&self) -> Device {
        if self.node_type == SEGMENT_TYPE {
            return Device::segment(self.id.clone());
        }
        Device::host(
            self.id.clone(),
            HostSpec {
                addresses: Addresses::new(
                    self.ip_public.as_deref(),
                    self.ip_private.as_deref(),
                    self.ip_tailscale.as_deref(),
                ),
                ping_enabled: self.ping_enabled.unwrap_or(false),
                ping_interval_secs: Some(self.ping_interval_sec).filter(|s| *s > 0),
                liveness_enabled: self.connect_enabled,
            },
        )
    }
}

/// Monitoring view of a board document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardSnapshot {
    pub policy: MonitoringPolicy,
    pub devices: Vec<Device>,
}

impl BoardSnapshot {
    /// Decode the monitoring parts of a board document.
    ///
    /// A missing or malformed `meta.monitoring` falls back to the default
    /// policy; node entries that fail to decode or carry no id are skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: serde_json::Value = serde_json::from_slice(bytes)?;

        let policy = doc
            .pointer("/meta/monitoring")
            .and_then(|v| serde_json::from_value::<MonitoringPolicy>(v.clone()).ok())
            .unwrap_or_else(|| MonitoringPolicy {
                interval_sec: 0,
                ..Default::default()
            });

        let devices = decode_nodes(doc.get("nodes"));
        Ok(Self { policy, devices })
    }
}

/// Decode a JSON array of nodes leniently into devices.
pub fn decode_nodes(nodes: Option<&serde_json::Value>) -> Vec<Device> {
    let Some(serde_json::Value::Array(items)) = nodes else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<BoardNode>(item.clone()) {
            Ok(node) if !node.id.is_empty() => Some(node.to_device()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Skipping malformed board node: {}", e);
                None
            }
        })
        .collect()
}

/// Authentication method for SSH liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    SshKey,
}

impl AuthMethod {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ssh_key" => Self::SshKey,
            _ => Self::Password,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::SshKey => "ssh_key",
        }
    }
}

/// Connection settings stored encrypted per device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceCredentials {
    pub os: String,
    pub host: String,
    pub port: u16,
    pub auth_method: String,
    pub username: String,
    pub password: String,
    pub private_key: String,
    pub private_key_passphrase: String,
    pub connect_enabled: bool,
    /// Detected speed of the primary interface; 0 when unknown.
    pub link_speed_mbps: i64,
}

impl DeviceCredentials {
    pub const DEFAULT_PORT: u16 = 22;

    pub fn auth(&self) -> AuthMethod {
        AuthMethod::parse(&self.auth_method)
    }

    pub fn port_or_default(&self) -> u16 {
        if self.port == 0 {
            Self::DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Normalize user input before it is stored.
    pub fn sanitize(mut self) -> Self {
        self.os = self.os.trim().to_lowercase();
        if self.os.is_empty() {
            self.os = "linux".to_string();
        }
        self.host = self.host.trim().to_string();
        self.port = self.port_or_default();
        self.username = self.username.trim().to_string();
        self.link_speed_mbps = self.link_speed_mbps.max(0);

        let auth = self.auth();
        self.auth_method = auth.as_str().to_string();
        match auth {
            AuthMethod::Password => {
                self.private_key.clear();
                self.private_key_passphrase.clear();
            }
            AuthMethod::SshKey => self.password.clear(),
        }
        self
    }
}

/// On-disk layout of the credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry of the in-memory event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: String,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}
