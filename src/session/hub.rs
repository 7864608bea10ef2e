//! Transport Hub: spec §4.2, §4.3, §6.3. One writer task per session
//! draining four bounded queues in strict priority order — control, then
//! terminal output, then SFTP responses, then telemetry — so a saturated
//! SFTP transfer never starves a resize ack or a ping. Each queue gets its
//! own capacity so a slow consumer backs up only its own producers (per the
//! teacher's per-channel `Sender<Frame>` shape in `ws.rs`, generalized to
//! four lanes instead of one).
//!
//! Byte-counted backpressure rides on top of the message-bounded channels:
//! `outbound_queue_bytes` caps the combined size of unconsumed terminal +
//! sftp payloads, and the terminal lane additionally paces itself against
//! `terminal_high_water`/`terminal_low_water` so a fast remote shell can't
//! just fill the message-count cap with oversized chunks before tripping
//! the wider queue limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Notify;

use crate::env::Env;
use crate::protocol::{BinaryFrame, BinaryFrameType, TextFrame};

const CONTROL_CAPACITY: usize = 64;
const TERMINAL_CAPACITY: usize = 256;
const SFTP_CAPACITY: usize = 256;
const TELEMETRY_CAPACITY: usize = 4;

/// Something the Transport Hub can write to the browser socket.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    Text(TextFrame),
    Binary(BinaryFrame),
}

impl From<TextFrame> for OutboundMessage {
    fn from(f: TextFrame) -> Self {
        OutboundMessage::Text(f)
    }
}

impl From<BinaryFrame> for OutboundMessage {
    fn from(f: BinaryFrame) -> Self {
        OutboundMessage::Binary(f)
    }
}

impl OutboundMessage {
    fn byte_len(&self) -> usize {
        match self {
            OutboundMessage::Binary(frame) => frame.payload.len(),
            OutboundMessage::Text(_) => 0,
        }
    }
}

/// Shared byte-budget tracker for one lane: callers add bytes before
/// enqueuing and the drain side subtracts them after dequeuing. `waiters`
/// wakes producers parked in `reserve` once the count drops.
struct ByteBudget {
    pending: AtomicUsize,
    cap: usize,
    resume: Notify,
}

impl ByteBudget {
    fn new(cap: usize) -> Self {
        Self { pending: AtomicUsize::new(0), cap: cap.max(1), resume: Notify::new() }
    }

    /// Blocks until there's room for `len` more bytes, then reserves it.
    async fn reserve(&self, len: usize) {
        loop {
            let current = self.pending.load(Ordering::Acquire);
            if current == 0 || current + len <= self.cap {
                self.pending.fetch_add(len, Ordering::AcqRel);
                return;
            }
            self.resume.notified().await;
        }
    }

    fn release(&self, len: usize) {
        if len == 0 {
            return;
        }
        self.pending.fetch_sub(len, Ordering::AcqRel);
        self.resume.notify_waiters();
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Hysteresis on top of a `ByteBudget` for the terminal lane specifically
/// (spec §4.3): once `high_water` is crossed, new writes block until usage
/// drops back to `low_water`, rather than resuming the instant there's a
/// single byte of headroom.
struct Watermarks {
    high: usize,
    low: usize,
    paused: std::sync::atomic::AtomicBool,
}

impl Watermarks {
    fn new(high: usize, low: usize) -> Self {
        Self { high: high.max(1), low: low.min(high.max(1)), paused: std::sync::atomic::AtomicBool::new(false) }
    }

    async fn wait_for_room(&self, budget: &ByteBudget) {
        loop {
            if self.paused.load(Ordering::Acquire) {
                if budget.pending() <= self.low {
                    self.paused.store(false, Ordering::Release);
                    return;
                }
                budget.resume.notified().await;
            } else {
                return;
            }
        }
    }

    fn note_enqueued(&self, pending_now: usize) {
        if pending_now >= self.high {
            self.paused.store(true, Ordering::Release);
        }
    }
}

pub struct TransportHub {
    control_tx: Sender<OutboundMessage>,
    terminal_tx: Sender<OutboundMessage>,
    sftp_tx: Sender<OutboundMessage>,
    telemetry_tx: Sender<OutboundMessage>,
    outbound_budget: Arc<ByteBudget>,
    terminal_watermarks: Arc<Watermarks>,
}

/// The consuming half, owned by the socket write loop.
pub struct HubReceiver {
    control_rx: Receiver<OutboundMessage>,
    terminal_rx: Receiver<OutboundMessage>,
    sftp_rx: Receiver<OutboundMessage>,
    telemetry_rx: Receiver<OutboundMessage>,
    outbound_budget: Arc<ByteBudget>,
}

impl TransportHub {
    pub fn new(env: &Env) -> (Self, HubReceiver) {
        let (control_tx, control_rx) = channel(CONTROL_CAPACITY);
        let (terminal_tx, terminal_rx) = channel(TERMINAL_CAPACITY);
        let (sftp_tx, sftp_rx) = channel(SFTP_CAPACITY);
        let (telemetry_tx, telemetry_rx) = channel(TELEMETRY_CAPACITY);

        let outbound_budget = Arc::new(ByteBudget::new(env.outbound_queue_bytes));
        let terminal_watermarks = Arc::new(Watermarks::new(env.terminal_high_water, env.terminal_low_water));

        (
            Self { control_tx, terminal_tx, sftp_tx, telemetry_tx, outbound_budget: outbound_budget.clone(), terminal_watermarks },
            HubReceiver { control_rx, terminal_rx, sftp_rx, telemetry_rx, outbound_budget },
        )
    }

    /// Connect lifecycle, errors, ping/pong: always delivered, even under
    /// transfer load. Not byte-budgeted; control traffic is small and must
    /// never wait behind a transfer.
    pub async fn send_control(&self, msg: impl Into<OutboundMessage>) -> bool {
        self.control_tx.send(msg.into()).await.is_ok()
    }

    /// Terminal output. Paces itself against `terminal_high_water`/
    /// `terminal_low_water` (spec §4.3) on top of the shared
    /// `outbound_queue_bytes` budget (spec §6.3): callers that stop getting
    /// woken here should also stop draining the PTY, which in turn lets
    /// SSH's own channel window throttle the remote shell.
    pub async fn send_terminal(&self, data: Bytes) -> bool {
        let len = data.len();
        self.terminal_watermarks.wait_for_room(&self.outbound_budget).await;
        self.outbound_budget.reserve(len).await;
        self.terminal_watermarks.note_enqueued(self.outbound_budget.pending());

        let ok = self
            .terminal_tx
            .send(OutboundMessage::Binary(BinaryFrame::empty_header(BinaryFrameType::SshData, data)))
            .await
            .is_ok();
        if !ok {
            self.outbound_budget.release(len);
        }
        ok
    }

    pub async fn send_sftp(&self, msg: impl Into<OutboundMessage>) -> bool {
        let msg = msg.into();
        let len = msg.byte_len();
        self.outbound_budget.reserve(len).await;
        let ok = self.sftp_tx.send(msg).await.is_ok();
        if !ok {
            self.outbound_budget.release(len);
        }
        ok
    }

    /// Telemetry is best-effort: a full queue means the writer is behind on
    /// more important work, so we drop the sample instead of blocking the
    /// collector (spec §4.8, lowest priority lane).
    pub fn try_send_telemetry(&self, msg: impl Into<OutboundMessage>) -> bool {
        match self.telemetry_tx.try_send(msg.into()) {
            Ok(()) => true,
            Err(_) => {
                warn!("telemetry queue full, dropping sample");
                false
            }
        }
    }
}

impl HubReceiver {
    /// Pulls the next message to write, honoring lane priority: control,
    /// terminal, sftp, telemetry. `biased` makes `select!` check branches
    /// top-to-bottom instead of at random, which is what gives the lanes
    /// their ordering.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        let msg = tokio::select! {
            biased;
            msg = self.control_rx.recv() => msg,
            msg = self.terminal_rx.recv() => msg,
            msg = self.sftp_rx.recv() => msg,
            msg = self.telemetry_rx.recv() => msg,
        };
        if let Some(msg) = &msg {
            self.outbound_budget.release(msg.byte_len());
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireErrorCode;

    fn test_env() -> Env {
        Env {
            mode: crate::env::Mode::Development,
            listen_addr: "0.0.0.0:0".into(),
            deployment_secret: String::new(),
            max_upload_bytes: 1 << 20,
            max_folder_bytes: 1 << 20,
            max_sessions: 10,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 60_000,
            session_idle_timeout_ms: 1_800_000,
            host_key_policy: crate::env::HostKeyPolicy::Tofu,
            known_hosts_path: String::new(),
            max_concurrent_ops: 4,
            upload_window: 4,
            upload_chunk_size: 1 << 18,
            outbound_queue_bytes: 1 << 20,
            terminal_high_water: 1024,
            terminal_low_water: 256,
            max_frame_payload_bytes: 1 << 22,
            telemetry_interval_ms: 1_000,
            database_url: String::new(),
        }
    }

    fn ping() -> TextFrame {
        TextFrame::Ping { t: 0 }
    }

    fn err() -> TextFrame {
        TextFrame::Error { code: WireErrorCode::Internal, message: "x".into(), retryable: false, operation_id: None }
    }

    #[tokio::test]
    async fn control_lane_is_drained_before_sftp_lane() {
        let (hub, mut rx) = TransportHub::new(&test_env());
        assert!(hub.send_sftp(err()).await);
        assert!(hub.send_control(ping()).await);

        match rx.recv().await {
            Some(OutboundMessage::Text(TextFrame::Ping { .. })) => {}
            other => panic!("expected control message first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn telemetry_drops_rather_than_blocks_when_full() {
        let (hub, _rx) = TransportHub::new(&test_env());
        for _ in 0..TELEMETRY_CAPACITY {
            assert!(hub.try_send_telemetry(ping()));
        }
        assert!(!hub.try_send_telemetry(ping()));
    }

    #[tokio::test]
    async fn terminal_send_pauses_past_high_water_and_resumes_after_drain() {
        let mut env = test_env();
        env.outbound_queue_bytes = 1 << 20;
        env.terminal_high_water = 100;
        env.terminal_low_water = 20;
        let (hub, mut rx) = TransportHub::new(&env);

        assert!(hub.send_terminal(Bytes::from(vec![0u8; 110])).await);
        assert!(hub.terminal_watermarks.paused.load(Ordering::Acquire));

        let hub = Arc::new(hub);
        let hub2 = hub.clone();
        let blocked = tokio::spawn(async move { hub2.send_terminal(Bytes::from(vec![0u8; 10])).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        rx.recv().await;
        assert!(blocked.await.unwrap());
    }

    #[tokio::test]
    async fn outbound_budget_blocks_sftp_sends_once_the_cap_is_reached() {
        let mut env = test_env();
        env.outbound_queue_bytes = 50;
        env.terminal_high_water = 1 << 20;
        env.terminal_low_water = 1 << 19;
        let (hub, mut rx) = TransportHub::new(&env);

        let header = serde_json::json!({ "operationId": "op1" });
        let first = BinaryFrame::new(BinaryFrameType::SftpFileData, header.clone(), Bytes::from(vec![0u8; 40]));
        assert!(hub.send_sftp(first).await);

        let hub = Arc::new(hub);
        let hub2 = hub.clone();
        let second_header = header.clone();
        let blocked = tokio::spawn(async move {
            let frame = BinaryFrame::new(BinaryFrameType::SftpFileData, second_header, Bytes::from(vec![0u8; 40]));
            hub2.send_sftp(frame).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        rx.recv().await;
        assert!(blocked.await.unwrap());
    }
}
