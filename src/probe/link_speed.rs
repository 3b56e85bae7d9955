//! Link speed detection over SSH.
//!
//! Finds the interface carrying the default route, then reads its speed from
//! `ethtool`, falling back to sysfs.

use std::sync::OnceLock;

use regex::Regex;
use russh::client;
use russh::ChannelMsg;

use super::ssh::{close, AcceptAnyHostKey};
use super::{LinkSpeed, LinkSpeedProbe, ProbeError, SessionTarget, SshProbe, LINK_SPEED_TIMEOUT};
use crate::storage::DeviceCredentials;

const ROUTE_INTERFACE: &str = r"ip route get 1.1.1.1 | sed -n 's/.* dev \([^ ]*\).*/\1/p'";
const FIRST_LINK: &str = r#"ip -o link show | awk -F': ' '$2 != "lo" {print $2; exit}'"#;
const FIRST_SYSFS_LINK: &str = r"ls /sys/class/net 2>/dev/null | grep -v '^lo$' | head -n1";

#[async_trait::async_trait]
impl LinkSpeedProbe for SshProbe {
    async fn detect(&self, credentials: &DeviceCredentials) -> Result<LinkSpeed, ProbeError> {
        if credentials.os != "linux" {
            return Err(ProbeError::Config(format!(
                "link speed detection is not supported for os={}",
                credentials.os
            )));
        }
        let target = SessionTarget::from_credentials(credentials)?;

        tokio::time::timeout(LINK_SPEED_TIMEOUT, async {
            let session = self.open(&target).await?;
            let detected = detect_linux(&session).await;
            close(session, &target.host).await;
            detected
        })
        .await
        .map_err(|_| ProbeError::Timeout(LINK_SPEED_TIMEOUT))?
    }
}

async fn detect_linux(session: &client::Handle<AcceptAnyHostKey>) -> Result<LinkSpeed, ProbeError> {
    let interface = find_interface(session).await?;

    let ethtool = format!("ethtool {} 2>/dev/null | awk -F': ' '/Speed:/ {{print $2; exit}}'", interface);
    if let Some(mbps) = run_command(session, &ethtool).await.ok().as_deref().and_then(parse_speed) {
        return Ok(LinkSpeed { mbps, interface });
    }

    let sysfs = format!("cat /sys/class/net/{}/speed", interface);
    if let Some(mbps) = run_command(session, &sysfs).await.ok().as_deref().and_then(parse_sysfs_speed) {
        return Ok(LinkSpeed { mbps, interface });
    }

    Err(ProbeError::Command(
        "speed unavailable (ethtool returned empty and sysfs missing)".to_string(),
    ))
}

async fn find_interface(session: &client::Handle<AcceptAnyHostKey>) -> Result<String, ProbeError> {
    for command in [ROUTE_INTERFACE, FIRST_LINK, FIRST_SYSFS_LINK] {
        let Ok(output) = run_command(session, command).await else {
            continue;
        };
        // `ip -o link` prints veth peers as name@peer
        let name = output.trim().split('@').next().unwrap_or_default();
        if is_interface_name(name) {
            return Ok(name.to_string());
        }
    }
    Err(ProbeError::Command("could not determine interface".to_string()))
}

/// The name is spliced into later commands, so only plain names pass.
fn is_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
}

/// Run one command on a fresh channel. Stdout and stderr are combined; a
/// non-zero exit status is an error.
async fn run_command(session: &client::Handle<AcceptAnyHostKey>, command: &str) -> Result<String, ProbeError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ProbeError::Command(e.to_string()))?;

    let mut output = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }

    match status {
        Some(code) if code != 0 => Err(ProbeError::Command(format!("exit status {}", code))),
        _ => Ok(String::from_utf8_lossy(&output).into_owned()),
    }
}

/// Parse an `ethtool` speed such as `1000Mb/s` or `2.5Gbps` into Mbps.
pub fn parse_speed(raw: &str) -> Option<u32> {
    static SPEED: OnceLock<Regex> = OnceLock::new();
    let speed = SPEED.get_or_init(|| Regex::new(r"(?i)([0-9]+(?:\.[0-9]+)?)\s*([mg]b(?:/s|ps))").unwrap());

    let value = raw.trim();
    if value.is_empty() || value.to_ascii_lowercase().contains("unknown") {
        return None;
    }
    let caps = speed.captures(value)?;
    let mut mbps: f64 = caps[1].parse().ok()?;
    if caps[2].starts_with(['g', 'G']) {
        mbps *= 1000.0;
    }
    if mbps <= 0.0 {
        return None;
    }
    Some((mbps + 0.5) as u32)
}

/// Parse `/sys/class/net/<iface>/speed`. `-1` and `0` mean unknown.
pub fn parse_sysfs_speed(raw: &str) -> Option<u32> {
    let value: i64 = raw.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    u32::try_from(value).ok()
}
