//! Telemetry Collector: spec §4.8, §3. Runs one canned, non-interactive
//! shell invocation over the session's own SSH connection and parses
//! `/proc/*` counters out of its stdout, so the sample describes the
//! connected remote target rather than the gateway's own host (contrast
//! `stats::Collector`, which samples the gateway process). Grounded in the
//! `.exec(true, cmd)` + `channel.wait()` capture loop other example repos
//! use for one-shot remote commands, adapted from an interactive shell to
//! a single probe invocation.

use std::sync::Arc;
use std::time::Duration;

use russh::ChannelMsg;
use serde::Serialize;

use crate::error::{GatewayError, Result};
use crate::ssh::ClientHandle;

/// Gap between the two `/proc/stat` and `/proc/net/dev` reads inside the
/// probe script; gives a rate instead of a cumulative counter from a
/// single invocation.
const PROBE_WINDOW: Duration = Duration::from_millis(200);

const PROBE_SCRIPT: &str = "\
echo __TS__ $(date +%s); \
echo __HOSTNAME__ $(hostname 2>/dev/null || uname -n); \
echo __UNAME__ $(uname -s) $(uname -m); \
echo __LOADAVG__ $(cat /proc/loadavg); \
echo __UPTIME__ $(cat /proc/uptime); \
echo __MEMINFO_BEGIN__; cat /proc/meminfo; echo __MEMINFO_END__; \
echo __DISK__ $(df -Pk / | tail -n 1); \
echo __CPU1__ $(grep '^cpu ' /proc/stat); \
echo __NET1_BEGIN__; cat /proc/net/dev; echo __NET1_END__; \
sleep 0.2; \
echo __CPU2__ $(grep '^cpu ' /proc/stat); \
echo __NET2_BEGIN__; cat /proc/net/dev; echo __NET2_END__\
";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetricSample {
    pub ts: i64,
    pub cpu_pct: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub net_up_bps: u64,
    pub net_down_bps: u64,
    pub load_avg: [f64; 3],
    pub uptime_sec: u64,
    pub host_info: HostInfo,
}

/// Runs the probe over `handle`'s own exec channel and parses the result.
/// One SSH exec per call.
pub async fn sample(handle: &ClientHandle) -> Result<RemoteMetricSample> {
    let output = exec_capture(handle, PROBE_SCRIPT).await?;
    parse_probe_output(&output, PROBE_WINDOW)
        .ok_or_else(|| GatewayError::Protocol("telemetry probe output did not parse".into()))
}

async fn exec_capture(handle: &ClientHandle, command: &str) -> Result<String> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut out = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => out.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }
    let _ = channel.close().await;
    String::from_utf8(out).map_err(|e| GatewayError::Protocol(format!("telemetry probe output not utf8: {e}")))
}

fn tagged<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.strip_prefix(tag).map(str::trim)
}

fn parse_probe_output(output: &str, window: Duration) -> Option<RemoteMetricSample> {
    let mut ts = None;
    let mut hostname = None;
    let mut os = None;
    let mut arch = None;
    let mut load_avg = None;
    let mut uptime_sec = None;
    let mut mem_total_kb = None;
    let mut mem_available_kb = None;
    let mut disk_total_kb = None;
    let mut disk_used_kb = None;
    let mut cpu1 = None;
    let mut cpu2 = None;
    let mut net1 = None;
    let mut net2 = None;

    let mut in_meminfo = false;
    let mut in_net1 = false;
    let mut in_net2 = false;

    for line in output.lines() {
        let line = line.trim_end();
        match line {
            "__MEMINFO_BEGIN__" => { in_meminfo = true; continue; }
            "__MEMINFO_END__" => { in_meminfo = false; continue; }
            "__NET1_BEGIN__" => { in_net1 = true; continue; }
            "__NET1_END__" => { in_net1 = false; continue; }
            "__NET2_BEGIN__" => { in_net2 = true; continue; }
            "__NET2_END__" => { in_net2 = false; continue; }
            _ => {}
        }

        if in_meminfo {
            if let Some(v) = line.strip_prefix("MemTotal:") {
                mem_total_kb = parse_meminfo_kb(v);
            } else if let Some(v) = line.strip_prefix("MemAvailable:") {
                mem_available_kb = parse_meminfo_kb(v);
            }
            continue;
        }
        if in_net1 {
            accumulate_net(line, &mut net1);
            continue;
        }
        if in_net2 {
            accumulate_net(line, &mut net2);
            continue;
        }

        if let Some(v) = tagged(line, "__TS__") {
            ts = v.parse::<i64>().ok();
        } else if let Some(v) = tagged(line, "__HOSTNAME__") {
            hostname = Some(v.to_string());
        } else if let Some(v) = tagged(line, "__UNAME__") {
            let mut parts = v.split_whitespace();
            os = parts.next().map(str::to_string);
            arch = parts.next().map(str::to_string);
        } else if let Some(v) = tagged(line, "__LOADAVG__") {
            load_avg = parse_loadavg(v);
        } else if let Some(v) = tagged(line, "__UPTIME__") {
            uptime_sec = v
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
                .map(|f| f as u64);
        } else if let Some(v) = tagged(line, "__DISK__") {
            let fields: Vec<&str> = v.split_whitespace().collect();
            if fields.len() >= 3 {
                disk_total_kb = fields[1].parse::<u64>().ok();
                disk_used_kb = fields[2].parse::<u64>().ok();
            }
        } else if let Some(v) = tagged(line, "__CPU1__") {
            cpu1 = parse_cpu_line(v);
        } else if let Some(v) = tagged(line, "__CPU2__") {
            cpu2 = parse_cpu_line(v);
        }
    }

    let (cpu1_total, cpu1_idle) = cpu1?;
    let (cpu2_total, cpu2_idle) = cpu2?;
    let total_delta = cpu2_total.saturating_sub(cpu1_total);
    let idle_delta = cpu2_idle.saturating_sub(cpu1_idle);
    let cpu_pct = if total_delta == 0 {
        0.0
    } else {
        (total_delta.saturating_sub(idle_delta)) as f64 / total_delta as f64 * 100.0
    };

    let (rx1, tx1) = net1?;
    let (rx2, tx2) = net2?;
    let seconds = window.as_secs_f64().max(0.001);
    let net_down_bps = ((rx2.saturating_sub(rx1)) as f64 / seconds) as u64;
    let net_up_bps = ((tx2.saturating_sub(tx1)) as f64 / seconds) as u64;

    let mem_total_kb = mem_total_kb?;
    let disk_total_kb = disk_total_kb?;
    let disk_used_kb = disk_used_kb?;

    Some(RemoteMetricSample {
        ts: ts?,
        cpu_pct,
        mem_total: mem_total_kb * 1024,
        mem_used: mem_total_kb.saturating_sub(mem_available_kb.unwrap_or(0)) * 1024,
        disk_total: disk_total_kb * 1024,
        disk_used: disk_used_kb * 1024,
        net_up_bps,
        net_down_bps,
        load_avg: load_avg?,
        uptime_sec: uptime_sec?,
        host_info: HostInfo {
            os: os.unwrap_or_else(|| "unknown".into()),
            arch: arch.unwrap_or_else(|| "unknown".into()),
            hostname: hostname.unwrap_or_else(|| "unknown".into()),
        },
    })
}

fn parse_meminfo_kb(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse::<u64>().ok()
}

fn parse_loadavg(value: &str) -> Option<[f64; 3]> {
    let mut parts = value.split_whitespace();
    let a = parts.next()?.parse::<f64>().ok()?;
    let b = parts.next()?.parse::<f64>().ok()?;
    let c = parts.next()?.parse::<f64>().ok()?;
    Some([a, b, c])
}

/// Parses one `/proc/stat` `cpu ` line into `(total_jiffies, idle_jiffies)`.
fn parse_cpu_line(value: &str) -> Option<(u64, u64)> {
    let fields: Vec<u64> = value.split_whitespace().filter_map(|f| f.parse::<u64>().ok()).collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some((total, idle))
}

/// Sums rx/tx byte counters across non-loopback interfaces from one
/// `/proc/net/dev` block into `acc`.
fn accumulate_net(line: &str, acc: &mut Option<(u64, u64)>) {
    let Some((iface, rest)) = line.split_once(':') else { return };
    if iface.trim() == "lo" {
        return;
    }
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 9 {
        return;
    }
    let rx: u64 = fields[0].parse().unwrap_or(0);
    let tx: u64 = fields[8].parse().unwrap_or(0);
    let entry = acc.get_or_insert((0, 0));
    entry.0 += rx;
    entry.1 += tx;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> String {
        "\
__TS__ 1700000000
__HOSTNAME__ box1
__UNAME__ Linux x86_64
__LOADAVG__ 0.10 0.20 0.30 1/200 1234
__UPTIME__ 12345.67 98765.43
__MEMINFO_BEGIN__
MemTotal:       16384000 kB
MemAvailable:    8192000 kB
__MEMINFO_END__
__DISK__ /dev/sda1 104857600 52428800 52428800 50% /
__CPU1__ cpu  1000 0 500 8000 100 0 0 0 0 0
__NET1_BEGIN__
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    100       1    0    0    0     0          0         0      100       1    0    0    0     0       0          0
  eth0:  10000      10    0    0    0     0          0         0     20000      20    0    0    0     0       0          0
__NET1_END__
__CPU2__ cpu  1020 0 510 8080 100 0 0 0 0 0
__NET2_BEGIN__
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    100       1    0    0    0     0          0         0      100       1    0    0    0     0       0          0
  eth0:  12000      12    0    0    0     0          0         0     24000      24    0    0    0     0       0          0
__NET2_END__
"
        .to_string()
    }

    #[test]
    fn parses_a_full_probe_sample() {
        let sample = parse_probe_output(&sample_output(), Duration::from_millis(200)).unwrap();
        assert_eq!(sample.ts, 1_700_000_000);
        assert_eq!(sample.host_info.hostname, "box1");
        assert_eq!(sample.host_info.os, "Linux");
        assert_eq!(sample.load_avg, [0.10, 0.20, 0.30]);
        assert_eq!(sample.mem_total, 16_384_000 * 1024);
        assert_eq!(sample.mem_used, (16_384_000 - 8_192_000) * 1024);
        assert_eq!(sample.disk_total, 104_857_600 * 1024);
        assert_eq!(sample.disk_used, 52_428_800 * 1024);
        assert_eq!(sample.uptime_sec, 12345);
    }

    #[test]
    fn cpu_percent_reflects_the_busy_delta() {
        let sample = parse_probe_output(&sample_output(), Duration::from_millis(200)).unwrap();
        // total delta 110, idle delta 80 -> ~27.3% busy
        assert!(sample.cpu_pct > 27.0 && sample.cpu_pct < 27.5);
    }

    #[test]
    fn net_rate_skips_loopback_and_uses_the_window() {
        let sample = parse_probe_output(&sample_output(), Duration::from_millis(200)).unwrap();
        assert_eq!(sample.net_down_bps, 10_000);
        assert_eq!(sample.net_up_bps, 20_000);
    }

    #[test]
    fn malformed_output_fails_to_parse() {
        assert!(parse_probe_output("garbage", Duration::from_millis(200)).is_none());
    }
}
