//! Keepalive & Watchdog: spec §4.9. Two independent concerns share this
//! module: sending the browser a `ping` on an interval so NAT/proxies
//! don't reap an idle WebSocket, and a watchdog that closes the session if
//! no `pong` (or any other inbound traffic) arrives within the idle
//! timeout. SSH-level keepalive is handled by russh itself via
//! `DialerConfig::keepalive_interval` (spec §4.6); this module only covers
//! the browser side. Grounded in the teacher's `spawn_ping_task` /
//! `spawn_cleanup_task` pair in `ws.rs`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::protocol::TextFrame;

use super::hub::TransportHub;

/// Tracks the last time inbound traffic was observed on the session, so
/// the watchdog can judge idleness without a separate message bus.
pub struct ActivityTracker {
    last_seen_unix_ms: AtomicI64,
}

impl ActivityTracker {
    pub fn new(now_unix_ms: i64) -> Self {
        Self { last_seen_unix_ms: AtomicI64::new(now_unix_ms) }
    }

    pub fn touch(&self, now_unix_ms: i64) {
        self.last_seen_unix_ms.store(now_unix_ms, Ordering::Relaxed);
    }

    pub fn idle_for_ms(&self, now_unix_ms: i64) -> i64 {
        (now_unix_ms - self.last_seen_unix_ms.load(Ordering::Relaxed)).max(0)
    }
}

/// Sends a `ping` frame on `period` until `cancel` fires. The browser is
/// expected to answer with `pong`, which the caller feeds into the
/// session's `ActivityTracker` via `touch`.
pub fn spawn_ping(hub: Arc<TransportHub>, period: Duration, now_unix_ms: impl Fn() -> i64 + Send + 'static, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !hub.send_control(TextFrame::Ping { t: now_unix_ms() }).await {
                        break;
                    }
                }
            }
        }
    });
}

/// Closes the session by cancelling `cancel` once `tracker` has been idle
/// for longer than `idle_timeout`.
pub fn spawn_watchdog(
    tracker: Arc<ActivityTracker>,
    idle_timeout: Duration,
    now_unix_ms: impl Fn() -> i64 + Send + 'static,
    check_period: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval(check_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let idle = tracker.idle_for_ms(now_unix_ms());
                    if idle >= idle_timeout.as_millis() as i64 {
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_for_ms_is_zero_immediately_after_touch() {
        let tracker = ActivityTracker::new(1_000);
        tracker.touch(1_000);
        assert_eq!(tracker.idle_for_ms(1_000), 0);
    }

    #[test]
    fn idle_for_ms_grows_with_elapsed_time() {
        let tracker = ActivityTracker::new(1_000);
        assert_eq!(tracker.idle_for_ms(5_000), 4_000);
    }

    #[test]
    fn idle_for_ms_never_goes_negative_on_clock_skew() {
        let tracker = ActivityTracker::new(5_000);
        assert_eq!(tracker.idle_for_ms(1_000), 0);
    }
}
