//! Reachability probe: native ICMP echo with `ping` command fallback.
//!
//! Native probes use blocking sockets in spawn_blocking for precise timing.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ReachabilityProbe, PING_TIMEOUT};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Reachability probe with a fixed per-probe deadline.
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new(PING_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for PingProbe {
    async fn probe(&self, address: &str) -> Result<u32, ProbeError> {
        run_ping_probe(address, self.timeout).await
    }
}

/// Generate a unique identifier for each echo request so concurrent pings
/// to the same destination can be told apart.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    fn domain(self) -> Domain {
        match self {
            Self::V4 => Domain::IPV4,
            Self::V6 => Domain::IPV6,
        }
    }

    fn protocol(self) -> Protocol {
        match self {
            Self::V4 => Protocol::ICMPV4,
            Self::V6 => Protocol::ICMPV6,
        }
    }

    fn echo_request(self) -> u8 {
        match self {
            Self::V4 => 8,
            Self::V6 => 128,
        }
    }

    fn echo_reply(self) -> u8 {
        match self {
            Self::V4 => 0,
            Self::V6 => 129,
        }
    }
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    match open_icmp_socket(Family::V4) {
        Ok((_, true)) => {
            tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
            IcmpCapability::Native
        }
        Ok((_, false)) => {
            tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
            IcmpCapability::Native
        }
        Err(_) => {
            tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
            IcmpCapability::CommandOnly
        }
    }
}

/// RAW first (CAP_NET_RAW or root), then DGRAM (unprivileged where the
/// kernel allows it). The flag reports whether the socket is RAW.
fn open_icmp_socket(family: Family) -> Result<(Socket, bool), ProbeError> {
    if let Ok(socket) = Socket::new(family.domain(), Type::RAW, Some(family.protocol())) {
        return Ok((socket, true));
    }
    Socket::new(family.domain(), Type::DGRAM, Some(family.protocol()))
        .map(|socket| (socket, false))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))
}

/// Ping `address` once. Returns the round-trip time in whole milliseconds.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<u32, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve before spawn_blocking (DNS is async)
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        return match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
                run_ping_command(address, timeout).await
            }
            other => other,
        };
    }

    run_ping_command(address, timeout).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Blocking ICMP echo with precise timing. Runs in a dedicated thread.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<u32, ProbeError> {
    let family = Family::of(&ip);
    let (socket, raw) = open_icmp_socket(family)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Loop until we get OUR reply or the deadline passes
    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_our_reply(data, family, raw, identifier, sequence) {
            return Ok(round_ms(elapsed.as_secs_f64() * 1000.0));
        }
    }
}

/// Check an echo reply against the request we sent.
///
/// RAW IPv4 sockets deliver the IP header too. DGRAM sockets have the kernel
/// rewrite the identifier, and it filters replies by it, so only the
/// sequence number is compared there.
fn is_our_reply(data: &[u8], family: Family, raw: bool, identifier: u16, sequence: u16) -> bool {
    let offset = if raw && family == Family::V4 && !data.is_empty() {
        usize::from(data[0] & 0x0f) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };
    let reply_type = icmp[0];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    reply_type == family.echo_reply() && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Build an ICMP/ICMPv6 Echo Request (8 byte header + 56 byte payload).
fn build_echo_request(family: Family, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = family.echo_request();
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum
    if family == Family::V4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Platform `ping` arguments for a single echo with a one second reply wait.
fn ping_command_args(address: &str) -> Vec<String> {
    let args: &[&str] = if cfg!(windows) {
        &["-n", "1", "-w", "1000"]
    } else if cfg!(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )) {
        &["-c", "1", "-W", "1000"]
    } else {
        &["-c", "1", "-W", "1"]
    };
    args.iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(address.to_string()))
        .collect()
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<u32, ProbeError> {
    let child = Command::new("ping")
        .args(ping_command_args(address))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() { stdout.trim() } else { detail };
        return Err(ProbeError::Command(format!("ping exited with {}: {}", output.status, detail)));
    }

    Ok(parse_rtt(&stdout).unwrap_or(0))
}

/// Round-trip time from ping output, rounded to the nearest millisecond.
///
/// Reads the per-packet `time=X ms` / `time<X ms` token, then the summary
/// line printed by Linux and BSD pings.
fn parse_rtt(output: &str) -> Option<u32> {
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<]\s*([0-9.]+)\s*ms").unwrap());

    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/([0-9.]+)/").unwrap()
    });

    per_packet
        .captures(output)
        .or_else(|| summary.captures(output))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(round_ms)
}

fn round_ms(ms: f64) -> u32 {
    (ms + 0.5) as u32
}
