//! Seam between the IPC layer and the platform telemetry source.
//!
//! The dispatch loop only depends on this trait; collector failures travel
//! back to the client as a failure flag plus message inside the response
//! payload, never as transport errors.

use anyhow::Result;
use netsight_common::protocol::{ConnectionStat, ProcessStat};

pub trait TelemetryCollector: Send + Sync {
    /// Snapshot of live transport connections.
    fn connection_stats(&self) -> Result<Vec<ConnectionStat>>;

    /// Per-process aggregates.
    fn process_stats(&self) -> Result<Vec<ProcessStat>>;
}

/// Default collector on Linux: a `/proc/net` snapshot.
#[cfg(target_os = "linux")]
pub struct ProcNetCollector;

#[cfg(target_os = "linux")]
impl TelemetryCollector for ProcNetCollector {
    fn connection_stats(&self) -> Result<Vec<ConnectionStat>> {
        let mut connections = Vec::new();
        for (path, protocol) in [
            ("/proc/net/tcp", "tcp"),
            ("/proc/net/tcp6", "tcp6"),
            ("/proc/net/udp", "udp"),
            ("/proc/net/udp6", "udp6"),
        ] {
            let table = match std::fs::read_to_string(path) {
                Ok(table) => table,
                // Address families can be compiled out of the kernel.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow::Error::from(e)
                        .context(format!("failed to read connection table {path}")))
                }
            };
            for line in table.lines().skip(1) {
                if let Some(stat) = parse_proc_net_line(line, protocol) {
                    connections.push(stat);
                }
            }
        }
        Ok(connections)
    }

    fn process_stats(&self) -> Result<Vec<ProcessStat>> {
        // Socket-inode-to-pid attribution needs a /proc/<pid>/fd sweep this
        // snapshot collector does not perform.
        Err(anyhow::anyhow!(
            "per-process attribution is not available from the /proc/net snapshot"
        ))
    }
}

/// Parses one `/proc/net/{tcp,udp}*` row:
/// `sl local_address rem_address st tx_queue:rx_queue ...` with addresses as
/// kernel-endian hex.
#[cfg(target_os = "linux")]
fn parse_proc_net_line(line: &str, protocol: &str) -> Option<ConnectionStat> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let remote = fields.next()?;
    let state = fields.next()?;
    let queues = fields.next()?;

    let (tx_queue, rx_queue) = queues.split_once(':')?;

    Some(ConnectionStat {
        protocol:       protocol.to_string(),
        local_addr:     decode_proc_net_addr(local)?,
        remote_addr:    decode_proc_net_addr(remote)?,
        state:          tcp_state_name(state).to_string(),
        owner_pid:      None,
        // TODO: replace queue depths with cumulative per-connection counters
        // once the eBPF accounting probe lands; /proc/net only exposes the
        // instantaneous queue sizes.
        bytes_sent:     u64::from_str_radix(tx_queue, 16).ok()?,
        bytes_received: u64::from_str_radix(rx_queue, 16).ok()?,
    })
}

#[cfg(target_os = "linux")]
fn decode_proc_net_addr(field: &str) -> Option<String> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    match addr_hex.len() {
        8 => {
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            let ip = std::net::Ipv4Addr::from(raw.to_le_bytes());
            Some(format!("{ip}:{port}"))
        }
        32 => {
            // Four little-endian 32-bit groups.
            let mut bytes = [0u8; 16];
            for (i, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
                let group = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
                bytes[i * 4..i * 4 + 4].copy_from_slice(&group.to_le_bytes());
            }
            let ip = std::net::Ipv6Addr::from(bytes);
            Some(format!("[{ip}]:{port}"))
        }
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn tcp_state_name(hex: &str) -> &'static str {
    match hex {
        "01" => "ESTABLISHED",
        "02" => "SYN_SENT",
        "03" => "SYN_RECV",
        "04" => "FIN_WAIT1",
        "05" => "FIN_WAIT2",
        "06" => "TIME_WAIT",
        "07" => "CLOSE",
        "08" => "CLOSE_WAIT",
        "09" => "LAST_ACK",
        "0A" => "LISTEN",
        "0B" => "CLOSING",
        _ => "UNKNOWN",
    }
}

/// Collector for platforms without a wired-up telemetry source. Every call
/// reports the degraded state through the normal payload path.
pub struct UnsupportedCollector;

impl TelemetryCollector for UnsupportedCollector {
    fn connection_stats(&self) -> Result<Vec<ConnectionStat>> {
        Err(anyhow::anyhow!(
            "no telemetry collector is available on this platform"
        ))
    }

    fn process_stats(&self) -> Result<Vec<ProcessStat>> {
        Err(anyhow::anyhow!(
            "no telemetry collector is available on this platform"
        ))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_listener_row() {
        let line =
            "   0: 0100007F:1F90 00000000:0000 0A 00000012:00000034 00:00000000 00000000  1000";
        let stat = parse_proc_net_line(line, "tcp").unwrap();
        assert_eq!(stat.local_addr, "127.0.0.1:8080");
        assert_eq!(stat.remote_addr, "0.0.0.0:0");
        assert_eq!(stat.state, "LISTEN");
        assert_eq!(stat.bytes_sent, 0x12);
        assert_eq!(stat.bytes_received, 0x34);
    }

    #[test]
    fn parses_ipv6_loopback() {
        let addr = decode_proc_net_addr("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(addr, "[::1]:80");
    }

    #[test]
    fn malformed_rows_are_skipped() {
        assert!(parse_proc_net_line("garbage", "tcp").is_none());
        assert!(parse_proc_net_line("   0: xyz 00000000:0000 0A 0:0", "tcp").is_none());
    }

    #[test]
    fn snapshot_reads_this_machine() {
        let stats = ProcNetCollector.connection_stats().unwrap();
        // The test runner always holds at least one socket.
        assert!(!stats.is_empty());
    }
}
