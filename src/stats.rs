//! Gateway self-stats, exposed at `/stats` and logged periodically by
//! `gateway::spawn_stats_logger`. This samples the gateway process's own
//! host, the same target the original's `Stats::gather` heartbeat reports
//! on — extended here with disk usage and a network throughput delta that
//! the original doesn't. Per-session remote-host telemetry (spec §4.8,
//! sampled over the connected SSH target rather than this process) lives
//! in `ssh::probe` instead.

use std::num::NonZeroUsize;
use std::time::Instant;

use get_if_addrs::{get_if_addrs, IfAddr};
use mac_address::get_mac_address;
use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, ProcessStatus, System, get_current_pid};
use thread_count::thread_count;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub ts: i64,
    pub pid: String,
    pub hostname: String,
    pub host_ip: String,
    pub host_mac: String,
    pub proc_threads: usize,
    pub proc_cpu: f32,
    pub proc_mem_bytes: u64,
    pub host_cpu: f32,
    pub host_mem_used_bytes: u64,
    pub host_mem_total_bytes: u64,
    pub host_disk_used_bytes: u64,
    pub host_disk_total_bytes: u64,
    pub host_uptime_secs: u64,
    pub proc_uptime_secs: u64,
    pub host_load_average: [f64; 3],
    pub host_os_info: String,
    pub host_connections: usize,
    pub host_processes: usize,
    pub net_rx_bps: u64,
    pub net_tx_bps: u64,
}

/// Tracks the previous sample's cumulative network counters so `gather`
/// can report a per-interval rate (spec §4.8) instead of a running total.
pub struct Collector {
    last_sample: Option<(Instant, u64, u64)>,
}

impl Collector {
    pub fn new() -> Self {
        Self { last_sample: None }
    }

    pub fn gather(&mut self) -> Option<MetricSample> {
        let mut sys = System::new_all();
        sys.refresh_all();

        let pid = get_current_pid().ok()?;
        let proc = sys.process(pid)?;
        let proc_threads = thread_count().map(NonZeroUsize::get).unwrap_or(0);

        let hostname = System::host_name().unwrap_or_else(|| "unknown".into());
        let host_ip = resolve_host_ip();
        let host_mac = resolve_mac();
        let host_os_info = format!("{}", os_info::get());
        let host_load_average = loadavg();
        let host_connections = connections().unwrap_or(0);
        let host_processes = sys
            .processes()
            .values()
            .filter(|p| p.status() == ProcessStatus::Run)
            .count();

        let disks = Disks::new_with_refreshed_list();
        let (host_disk_used_bytes, host_disk_total_bytes) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
            let disk_total = disk.total_space();
            let disk_free = disk.available_space();
            (used + disk_total.saturating_sub(disk_free), total + disk_total)
        });

        let (rx_total, tx_total) = interface_byte_totals();
        let now = Instant::now();
        let (net_rx_bps, net_tx_bps) = match self.last_sample {
            Some((prev_at, prev_rx, prev_tx)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64().max(0.001);
                (
                    ((rx_total.saturating_sub(prev_rx)) as f64 / elapsed) as u64,
                    ((tx_total.saturating_sub(prev_tx)) as f64 / elapsed) as u64,
                )
            }
            None => (0, 0),
        };
        self.last_sample = Some((now, rx_total, tx_total));

        Some(MetricSample {
            ts: chrono::Utc::now().timestamp(),
            pid: pid.to_string(),
            hostname,
            host_ip,
            host_mac,
            proc_threads,
            proc_cpu: proc.cpu_usage(),
            proc_mem_bytes: proc.memory(),
            proc_uptime_secs: proc.run_time(),
            host_cpu: sys.global_cpu_usage(),
            host_mem_used_bytes: sys.used_memory(),
            host_mem_total_bytes: sys.total_memory(),
            host_disk_used_bytes,
            host_disk_total_bytes,
            host_uptime_secs: System::uptime(),
            host_load_average,
            host_os_info,
            host_connections,
            host_processes,
            net_rx_bps,
            net_tx_bps,
        })
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_mac() -> String {
    match get_mac_address() {
        Ok(Some(addr)) => addr.to_string(),
        _ => "unknown".into(),
    }
}

fn connections() -> anyhow::Result<usize> {
    let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let proto_flags = ProtocolFlags::TCP | ProtocolFlags::UDP;
    let sockets = get_sockets_info(af_flags, proto_flags)?;
    Ok(sockets.len())
}

#[cfg(unix)]
fn loadavg() -> [f64; 3] {
    let mut v = [0f64; 3];
    let n = unsafe { libc::getloadavg(v.as_mut_ptr(), 3) };
    if n == 3 {
        [v[0], v[1], v[2]]
    } else {
        [0.0, 0.0, 0.0]
    }
}

#[cfg(not(unix))]
fn loadavg() -> [f64; 3] {
    [0.0, 0.0, 0.0]
}

fn resolve_host_ip() -> String {
    match get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                if interface.is_loopback() {
                    continue;
                }
                return match interface.addr {
                    IfAddr::V4(v4) => v4.ip.to_string(),
                    IfAddr::V6(v6) => v6.ip.to_string(),
                };
            }
            "unknown".into()
        }
        Err(_) => "unknown".into(),
    }
}

fn interface_byte_totals() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_all();
    // sysinfo's Networks type is the grounded source of cumulative
    // rx/tx byte counters; get_if_addrs only gives us addresses, not traffic.
    let networks = sysinfo::Networks::new_with_refreshed_list();
    networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
        (rx + data.total_received(), tx + data.total_transmitted())
    })
}
