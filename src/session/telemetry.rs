//! Telemetry Collector wiring: spec §4.8. Periodically samples the
//! connected remote target over the session's own SSH connection via
//! `ssh::probe` and pushes each sample onto the hub's lowest priority
//! lane. Grounded in the teacher's `spawn_heartbeat_task` shape in
//! `ws.rs`: a ticking interval plus a `CancellationToken` to stop cleanly.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::protocol::TextFrame;
use crate::ssh::{probe, ClientHandle};

use super::hub::TransportHub;

/// Backoff ladder on probe failure (spec §4.8): 1s, 2s, 5s, capped.
const BACKOFF_STEPS_MS: [u64; 3] = [1_000, 2_000, 5_000];

/// Spawns the periodic sampling task. Returns immediately; the task runs
/// until `cancel` fires.
pub fn spawn(hub: Arc<TransportHub>, ssh: Arc<ClientHandle>, period: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut backoff_step: usize = 0;

        // Skip the immediate sample so the session isn't asked to emit
        // telemetry before its SSH connection has settled.
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }

        loop {
            match probe::sample(&ssh).await {
                Ok(sample) => {
                    backoff_step = 0;
                    let value = match serde_json::to_value(&sample) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("failed to serialize telemetry sample: {e}");
                            continue;
                        }
                    };
                    hub.try_send_telemetry(TextFrame::TelemetrySample { sample: value });
                }
                Err(e) => {
                    hub.try_send_telemetry(TextFrame::TelemetryError { reason: e.to_string() });
                    backoff_step = (backoff_step + 1).min(BACKOFF_STEPS_MS.len() - 1);
                }
            }

            let delay = if backoff_step == 0 { period } else { Duration::from_millis(BACKOFF_STEPS_MS[backoff_step - 1]) };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_five_seconds() {
        let mut step = 0usize;
        for _ in 0..10 {
            step = (step + 1).min(BACKOFF_STEPS_MS.len() - 1);
        }
        assert_eq!(BACKOFF_STEPS_MS[step], 5_000);
    }
}
