//! Session state machine: spec §4.1. One `run` call owns one browser
//! WebSocket end to end — Accepted, through Authenticating, into Ready,
//! down to Closed — composing every other per-connection module (Transport
//! Hub, Terminal Channel, SFTP Operation Manager + actions, SSH Dialer,
//! Credential Vault, Keepalive/Watchdog, Telemetry). Grounded in the
//! teacher's `daemon/src/ws.rs` connection-handling loop and
//! `server/src/web.rs`'s `handle_web_socket`/`handle_web_messages` split,
//! generalized from a relay-frame dispatch to the browser-facing SSH/SFTP
//! protocol this crate implements.

pub mod hub;
pub mod keepalive;
pub mod telemetry;
pub mod terminal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use russh_sftp::client::SftpSession;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use uuid::Uuid;

use crate::env::Env;
use crate::error::{GatewayError, Result, WireErrorCode};
use crate::protocol::text::ConnectAuth;
use crate::protocol::{BinaryFrame, BinaryFrameType, TextFrame};
use crate::registry::Registry;
use crate::sftp::actions;
use crate::sftp::actions::archive;
use crate::sftp::{Operation, OperationKind, OperationManager};
use crate::ssh::{dial, ClientHandle, Credential, DialError, DialerConfig, Target};
use crate::store::PostgresStore;
use crate::vault::{CredentialPlaintext, Vault};

use self::hub::TransportHub;
use self::keepalive::{spawn_ping, spawn_watchdog, ActivityTracker};
use self::terminal::TerminalHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Accepted,
    Authenticating,
    Ready,
    Closed,
}

struct UploadCtx {
    upload: actions::upload::Upload,
    op: Arc<Operation>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    bytes_total: u64,
    last_progress_at: Instant,
    last_progress_bytes: u64,
    sftp: Arc<SftpSession>,
}

/// Everything the read loop needs that isn't already `Clone`-cheap (the hub,
/// the dialer config); kept as one struct so each dispatch method takes
/// `&mut self` instead of a long parameter list.
struct SessionInner {
    id: Ulid,
    env: Arc<Env>,
    vault: Arc<Vault>,
    store: Option<Arc<PostgresStore>>,
    dialer_cfg: Arc<DialerConfig>,
    registry: Arc<Registry>,
    hub: Arc<TransportHub>,
    cancel: CancellationToken,
    op_manager: Arc<OperationManager>,
    ping_activity: Arc<ActivityTracker>,
    state: State,
    ssh: Option<Arc<ClientHandle>>,
    sftp: Option<Arc<SftpSession>>,
    terminal: Option<TerminalHandle>,
    uploads: HashMap<String, UploadCtx>,
    started_at: chrono::DateTime<chrono::Utc>,
    target_host: String,
    target_user: String,
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Terminal geometry clamp (spec §4.3: `cols∈[1,500]`, `rows∈[1,500]`).
/// Zero is rejected as a protocol error upstream of this call; anything
/// above 500 is silently capped rather than rejected.
fn clamp_geometry(value: u32) -> u32 {
    value.min(500)
}

/// Accepts one upgraded WebSocket and runs it to completion. Never returns
/// an error: every failure path reports itself over the socket (or simply
/// closes) and then returns, since there is no caller left to hand an error
/// to once the upgrade has happened.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    socket: WebSocket,
    env: Arc<Env>,
    vault: Arc<Vault>,
    dialer_cfg: Arc<DialerConfig>,
    registry: Arc<Registry>,
    store: Option<Arc<PostgresStore>>,
) {
    let id = Ulid::new();
    let cancel = CancellationToken::new();

    let guard = match registry.register(id, String::new(), String::new(), cancel.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            warn!("session {id} rejected: {e}");
            return;
        }
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let (hub, hub_rx) = TransportHub::new(&env);
    let hub = Arc::new(hub);
    let activity = Arc::new(ActivityTracker::new(now_ms()));

    let ping_activity = Arc::new(ActivityTracker::new(now_ms()));

    let writer = tokio::spawn(write_loop(hub_rx, ws_tx, cancel.clone()));
    spawn_watchdog(
        activity.clone(),
        Duration::from_millis(env.session_idle_timeout_ms),
        now_ms,
        Duration::from_secs(5),
        cancel.clone(),
    );
    // Distinct from the idle watchdog above: this one only resets on a
    // `pong`, so a browser that stops answering pings (but would otherwise
    // look "active") still gets reaped within `ping_timeout_ms`.
    spawn_watchdog(
        ping_activity.clone(),
        Duration::from_millis(env.ping_timeout_ms),
        now_ms,
        Duration::from_secs(5),
        cancel.clone(),
    );

    let op_manager = Arc::new(OperationManager::new(env.max_concurrent_ops));
    let max_frame_payload = env.max_frame_payload_bytes;
    let started_at = chrono::Utc::now();

    let mut inner = SessionInner {
        id,
        env,
        vault,
        store,
        dialer_cfg,
        registry: registry.clone(),
        hub: hub.clone(),
        cancel: cancel.clone(),
        op_manager,
        ping_activity,
        state: State::Accepted,
        ssh: None,
        sftp: None,
        terminal: None,
        uploads: HashMap::new(),
        started_at,
        target_host: String::new(),
        target_user: String::new(),
    };

    let mut close_reason = "client disconnect".to_string();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                close_reason = "cancelled".into();
                break;
            }
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => { warn!("session {id} websocket error: {e}"); break; }
                };
                activity.touch(now_ms());
                match msg {
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Text(text) => {
                        let outcome = match serde_json::from_str::<TextFrame>(&text) {
                            Ok(frame) => inner.handle_text(frame).await,
                            Err(e) => Err(GatewayError::Protocol(format!("malformed frame: {e}"))),
                        };
                        if let Err(e) = outcome {
                            close_reason = e.to_string();
                            inner.fail_session(e).await;
                        }
                        if inner.state == State::Closed {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        let outcome = match BinaryFrame::decode(&data, max_frame_payload) {
                            Ok(frame) => inner.handle_binary(frame).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = outcome {
                            close_reason = e.to_string();
                            inner.fail_session(e).await;
                        }
                        if inner.state == State::Closed {
                            break;
                        }
                    }
                }
            }
        }
    }

    cancel.cancel();
    inner.op_manager.cancel_all();
    if let Some(mut terminal) = inner.terminal.take() {
        terminal.shutdown().await;
    }
    if let Some(store) = inner.store.clone() {
        let session_id = inner.id.to_string();
        let target_host = inner.target_host.clone();
        let target_user = inner.target_user.clone();
        let started_at = inner.started_at;
        tokio::spawn(async move {
            let ended_at = chrono::Utc::now();
            if let Err(e) = store.log_session(&session_id, &target_host, &target_user, started_at, ended_at, &close_reason).await {
                warn!("failed to log session {session_id}: {e}");
            }
        });
    }
    drop(guard);
    writer.abort();
    info!("session {id} closed");
}

async fn write_loop(
    mut hub_rx: hub::HubReceiver,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = hub_rx.recv() => {
                let Some(msg) = msg else { break };
                let sent = match msg {
                    hub::OutboundMessage::Text(frame) => match serde_json::to_string(&frame) {
                        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                        Err(e) => { warn!("failed to encode text frame: {e}"); continue; }
                    },
                    hub::OutboundMessage::Binary(frame) => match frame.encode() {
                        Ok(bytes) => ws_tx.send(Message::Binary(bytes)).await,
                        Err(e) => { warn!("failed to encode binary frame: {e}"); continue; }
                    },
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

fn dial_error_wire_code(e: &DialError) -> WireErrorCode {
    match e {
        DialError::AuthFailed => WireErrorCode::Auth,
        DialError::Timeout => WireErrorCode::Timeout,
        DialError::Dns(_) | DialError::Unreachable(_) | DialError::HandshakeFailed(_) | DialError::HostKeyRejected => {
            WireErrorCode::Network
        }
    }
}

impl SessionInner {
    async fn fail_session(&mut self, err: GatewayError) {
        let code = err.wire_code();
        self.hub
            .send_control(TextFrame::Error { code, message: err.to_string(), retryable: code.retryable(), operation_id: None })
            .await;
        self.state = State::Closed;
    }

    async fn handle_text(&mut self, frame: TextFrame) -> Result<()> {
        match (self.state, frame) {
            (State::Accepted, TextFrame::Connect { host, port, user, auth }) => {
                self.state = State::Authenticating;
                self.connect(host, port, user, auth).await
            }
            (_, TextFrame::Ping { t }) => {
                self.hub.send_control(TextFrame::Pong { t, t_server: now_ms() }).await;
                Ok(())
            }
            (_, TextFrame::Pong { .. }) => {
                self.ping_activity.touch(now_ms());
                Ok(())
            }
            (_, TextFrame::Disconnect) => {
                self.state = State::Closed;
                Ok(())
            }
            (State::Ready, TextFrame::TerminalOpen { cols, rows, term }) => self.open_terminal(cols, rows, term).await,
            (State::Ready, TextFrame::TerminalResize { cols, rows }) => self.resize_terminal(cols, rows).await,
            (State::Ready, TextFrame::SftpList { operation_id, path }) => self.do_list(operation_id, path).await,
            (State::Ready, TextFrame::SftpMkdir { operation_id, path, mode, recursive }) => {
                self.do_mkdir(operation_id, path, mode, recursive).await
            }
            (State::Ready, TextFrame::SftpRename { operation_id, from, to }) => self.do_rename(operation_id, from, to).await,
            (State::Ready, TextFrame::SftpChmod { operation_id, path, mode }) => self.do_chmod(operation_id, path, mode).await,
            (State::Ready, TextFrame::SftpDelete { operation_id, path, recursive }) => {
                self.do_delete(operation_id, path, recursive).await
            }
            (State::Ready, TextFrame::SftpUpload { operation_id, path, size }) => self.begin_upload(operation_id, path, size).await,
            (State::Ready, TextFrame::SftpDownload { operation_id, path }) => self.begin_download(operation_id, path).await,
            (State::Ready, TextFrame::SftpDownloadFolder { operation_id, path }) => {
                self.begin_download_folder(operation_id, path).await
            }
            (State::Ready, TextFrame::SftpCancel { operation_id }) => {
                self.cancel_operation(&operation_id);
                Ok(())
            }
            (state, other) => Err(GatewayError::Protocol(format!("frame {other:?} invalid in state {state:?}"))),
        }
    }

    async fn handle_binary(&mut self, frame: BinaryFrame) -> Result<()> {
        match frame.kind {
            BinaryFrameType::SshData => {
                if self.state == State::Ready {
                    if let Some(terminal) = &self.terminal {
                        terminal.send_input(frame.payload).await;
                    }
                }
                Ok(())
            }
            BinaryFrameType::SftpUpload => {
                if self.state != State::Ready {
                    return Err(GatewayError::Protocol("upload chunk before session ready".into()));
                }
                let operation_id = frame
                    .operation_id()
                    .map(str::to_string)
                    .ok_or_else(|| GatewayError::Protocol("upload chunk missing operationId".into()))?;
                let seq = frame
                    .header
                    .get("seq")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| GatewayError::Protocol("upload chunk missing seq".into()))? as u32;
                self.handle_upload_chunk(operation_id, seq, frame.payload).await
            }
            other => Err(GatewayError::Protocol(format!("unexpected binary frame type {other:?} from browser"))),
        }
    }

    async fn connect(&mut self, host: String, port: u16, user: String, auth: ConnectAuth) -> Result<()> {
        let credential = if let Some(password) = auth.password.clone() {
            Credential::Password(password)
        } else if let Some(key_pem) = auth.private_key.clone() {
            Credential::PrivateKey { key_pem, passphrase: auth.passphrase.clone() }
        } else if let Some(credential_id) = auth.credential_id.clone() {
            self.resolve_stored_credential(&credential_id).await?
        } else {
            return Err(GatewayError::Auth("connect carried no password, privateKey, or credentialId".into()));
        };

        self.target_host = host.clone();
        self.target_user = user.clone();
        self.registry.set_target(self.id, host.clone(), user.clone());

        let target = Target { host, port, user };
        match dial(&target, &credential, &self.dialer_cfg).await {
            Ok(handle) => {
                let ssh = Arc::new(handle);
                self.ssh = Some(ssh.clone());
                self.state = State::Ready;
                self.hub.send_control(TextFrame::Connected { server_version: crate::env::version().to_string() }).await;
                spawn_ping(self.hub.clone(), Duration::from_millis(self.env.ping_interval_ms), now_ms, self.cancel.clone());
                telemetry::spawn(self.hub.clone(), ssh, Duration::from_millis(self.env.telemetry_interval_ms), self.cancel.clone());
                Ok(())
            }
            Err(e) => {
                self.state = State::Closed;
                let code = dial_error_wire_code(&e);
                self.hub
                    .send_control(TextFrame::Error { code, message: e.to_string(), retryable: code.retryable(), operation_id: None })
                    .await;
                Ok(())
            }
        }
    }

    async fn resolve_stored_credential(&self, credential_id: &str) -> Result<Credential> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| GatewayError::Auth("no credential store configured for this gateway".into()))?;
        let id = Uuid::parse_str(credential_id).map_err(|e| GatewayError::Auth(format!("invalid credentialId: {e}")))?;
        let record = store.get_credential(id).await.map_err(GatewayError::Anyhow)?;
        let plaintext = self.vault.decrypt_credential(&record.ciphertext)?;
        Ok(match plaintext {
            CredentialPlaintext::Password { password } => Credential::Password(Vault::expose(&password).to_string()),
            CredentialPlaintext::PrivateKey { private_key, passphrase } => Credential::PrivateKey {
                key_pem: Vault::expose(&private_key).to_string(),
                passphrase: passphrase.as_ref().map(|p| Vault::expose(p).to_string()),
            },
        })
    }

    async fn ensure_sftp(&mut self) -> Result<Arc<SftpSession>> {
        if let Some(sftp) = &self.sftp {
            return Ok(sftp.clone());
        }
        let ssh = self.ssh.clone().ok_or_else(|| GatewayError::Protocol("sftp requested before connect".into()))?;
        let channel = ssh.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = Arc::new(SftpSession::new(channel.into_stream()).await?);
        self.sftp = Some(sftp.clone());
        Ok(sftp)
    }

    async fn open_terminal(&mut self, cols: u32, rows: u32, term: Option<String>) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(GatewayError::Protocol("terminal geometry must not be zero".into()));
        }
        let ssh = self.ssh.clone().ok_or_else(|| GatewayError::Protocol("connect before terminal.open".into()))?;
        let handle = terminal::open(ssh, self.hub.clone(), clamp_geometry(cols), clamp_geometry(rows), term).await?;
        self.terminal = Some(handle);
        Ok(())
    }

    async fn resize_terminal(&mut self, cols: u32, rows: u32) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(GatewayError::Protocol("terminal.resize to zero geometry".into()));
        }
        if let Some(terminal) = &self.terminal {
            terminal.resize(clamp_geometry(cols), clamp_geometry(rows)).await;
        }
        Ok(())
    }

    async fn do_list(&mut self, operation_id: String, path: String) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        self.run_simple_op(operation_id, OperationKind::List, path.clone(), None, async move {
            actions::list::list(&sftp, &path).await.map(|entries| serde_json::json!({ "entries": entries }))
        })
        .await
    }

    async fn do_mkdir(&mut self, operation_id: String, path: String, _mode: Option<u32>, recursive: bool) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        self.run_simple_op(operation_id, OperationKind::Mkdir, path.clone(), None, async move {
            actions::mkdir::mkdir(&sftp, &path, recursive).await.map(|()| serde_json::json!({ "ok": true }))
        })
        .await
    }

    async fn do_rename(&mut self, operation_id: String, from: String, to: String) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        self.run_simple_op(operation_id, OperationKind::Rename, from.clone(), None, async move {
            actions::rename::rename(&sftp, &from, &to).await.map(|()| serde_json::json!({ "ok": true }))
        })
        .await
    }

    async fn do_chmod(&mut self, operation_id: String, path: String, mode: u32) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        self.run_simple_op(operation_id, OperationKind::Chmod, path.clone(), None, async move {
            actions::chmod::chmod(&sftp, &path, mode).await.map(|()| serde_json::json!({ "ok": true }))
        })
        .await
    }

    async fn do_delete(&mut self, operation_id: String, path: String, recursive: bool) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        self.run_simple_op(operation_id, OperationKind::Delete, path.clone(), None, async move {
            actions::delete::delete(&sftp, &path, recursive).await.map(|()| serde_json::json!({ "ok": true }))
        })
        .await
    }

    /// Shared shape for the non-streaming `sftp.*` verbs: register with the
    /// Operation Manager, run the action, report `sftp.done`/`sftp.failed`.
    async fn run_simple_op<F>(
        &mut self,
        operation_id: String,
        kind: OperationKind,
        path: String,
        bytes_total: Option<u64>,
        action: F,
    ) -> Result<()>
    where
        F: std::future::Future<Output = Result<Value>>,
    {
        let (op, _permit) = self.op_manager.begin(operation_id.clone(), kind, path, bytes_total).await?;
        let result = action.await;
        match &result {
            Ok(_) => op.mark_done(),
            Err(e) => op.mark_failed(e.to_string()),
        }
        self.op_manager.finish(&operation_id);
        match result {
            Ok(value) => {
                self.hub.send_sftp(TextFrame::SftpDone { operation_id, result: value }).await;
            }
            Err(e) => {
                self.hub.send_sftp(TextFrame::SftpFailed { operation_id, code: e.wire_code(), message: e.to_string() }).await;
            }
        }
        Ok(())
    }

    async fn begin_upload(&mut self, operation_id: String, path: String, size: u64) -> Result<()> {
        if size > self.env.max_upload_bytes {
            self.hub
                .send_sftp(TextFrame::SftpFailed {
                    operation_id,
                    code: WireErrorCode::Quota,
                    message: format!("upload of {size} bytes exceeds MAX_UPLOAD_BYTES"),
                })
                .await;
            return Ok(());
        }
        let sftp = self.ensure_sftp().await?;
        let (op, permit) = self.op_manager.begin(operation_id.clone(), OperationKind::Upload, path.clone(), Some(size)).await?;
        let upload = match actions::upload::Upload::open(&sftp, &path).await {
            Ok(u) => u,
            Err(e) => {
                op.mark_failed(e.to_string());
                self.op_manager.finish(&operation_id);
                self.hub.send_sftp(TextFrame::SftpFailed { operation_id, code: e.wire_code(), message: e.to_string() }).await;
                return Ok(());
            }
        };
        self.uploads.insert(
            operation_id.clone(),
            UploadCtx {
                upload,
                op,
                _permit: permit,
                bytes_total: size,
                last_progress_at: Instant::now(),
                last_progress_bytes: 0,
                sftp,
            },
        );
        self.hub
            .send_control(TextFrame::SftpUploadReady { operation_id, chunk_size: self.env.upload_chunk_size, window: self.env.upload_window })
            .await;
        Ok(())
    }

    async fn handle_upload_chunk(&mut self, operation_id: String, seq: u32, payload: Bytes) -> Result<()> {
        let Some(ctx) = self.uploads.get_mut(&operation_id) else {
            return Ok(());
        };
        if ctx.op.is_cancelled() {
            self.uploads.remove(&operation_id);
            return Ok(());
        }

        if let Err(e) = ctx.upload.write_chunk(seq, &payload).await {
            let ctx = self.uploads.remove(&operation_id).expect("checked above");
            ctx.op.mark_failed(e.to_string());
            ctx.upload.abort(&ctx.sftp).await;
            self.op_manager.finish(&operation_id);
            self.hub.send_sftp(TextFrame::SftpFailed { operation_id, code: e.wire_code(), message: e.to_string() }).await;
            return Ok(());
        }

        let chunk_len = payload.len() as u64;
        let done = ctx.op.add_bytes(chunk_len);
        let bytes_total = ctx.bytes_total;
        self.hub.send_sftp(TextFrame::SftpUploadAck { operation_id: operation_id.clone(), seq }).await;

        let should_report = {
            let ctx = self.uploads.get_mut(&operation_id).expect("present");
            let should = ctx.last_progress_at.elapsed() >= Duration::from_millis(100) || done.saturating_sub(ctx.last_progress_bytes) >= 1_048_576;
            if should {
                ctx.last_progress_at = Instant::now();
                ctx.last_progress_bytes = done;
            }
            should
        };
        if should_report {
            self.hub.send_sftp(TextFrame::SftpProgress { operation_id: operation_id.clone(), bytes_done: done, bytes_total: Some(bytes_total) }).await;
        }

        if done >= bytes_total {
            let ctx = self.uploads.remove(&operation_id).expect("present");
            let op = ctx.op.clone();
            match ctx.upload.finish(&ctx.sftp).await {
                Ok(()) => {
                    op.mark_done();
                    self.op_manager.finish(&operation_id);
                    self.hub.send_sftp(TextFrame::SftpDone { operation_id, result: serde_json::json!({ "bytes": done }) }).await;
                }
                Err(e) => {
                    op.mark_failed(e.to_string());
                    self.op_manager.finish(&operation_id);
                    self.hub.send_sftp(TextFrame::SftpFailed { operation_id, code: e.wire_code(), message: e.to_string() }).await;
                }
            }
        }
        Ok(())
    }

    async fn begin_download(&mut self, operation_id: String, path: String) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        let (op, permit) = self.op_manager.begin(operation_id.clone(), OperationKind::Download, path.clone(), None).await?;
        let hub = self.hub.clone();
        let op_manager = self.op_manager.clone();
        let chunk_size = self.env.upload_chunk_size;

        tokio::spawn(async move {
            let _permit = permit;
            let op_id = op.operation_id.clone();
            let result = run_download(&sftp, &path, chunk_size, &hub, &op).await;
            op_manager.finish(&op_id);
            report_stream_outcome(&hub, &op, op_id, result, |total| serde_json::json!({ "bytes": total })).await;
        });
        Ok(())
    }

    async fn begin_download_folder(&mut self, operation_id: String, path: String) -> Result<()> {
        let sftp = self.ensure_sftp().await?;
        let (op, permit) = self.op_manager.begin(operation_id.clone(), OperationKind::DownloadFolder, path.clone(), None).await?;
        self.hub
            .send_control(TextFrame::SftpDownloadFolderReady { operation_id: operation_id.clone(), format: "tar.gz".into() })
            .await;

        let hub = self.hub.clone();
        let op_manager = self.op_manager.clone();
        let max_folder_bytes = self.env.max_folder_bytes;
        let cancel = op.cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let op_id = op.operation_id.clone();
            let (tx, mut rx) = mpsc::channel(8);

            let forward_hub = hub.clone();
            let forward_op_id = op_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let header = serde_json::json!({ "operationId": forward_op_id });
                    if !forward_hub.send_sftp(BinaryFrame::new(BinaryFrameType::SftpFolderData, header, chunk.data)).await {
                        break;
                    }
                }
            });

            let result = archive::stream_folder(&sftp, &path, max_folder_bytes, tx, cancel).await;
            let _ = forwarder.await;
            op_manager.finish(&op_id);
            report_stream_outcome(&hub, &op, op_id, result, |outcome| {
                serde_json::json!({ "bytes": outcome.bytes_done, "skipped": outcome.skipped })
            })
            .await;
        });
        Ok(())
    }

    fn cancel_operation(&mut self, operation_id: &str) {
        self.op_manager.cancel(operation_id);
        if let Some(ctx) = self.uploads.remove(operation_id) {
            let op_manager = self.op_manager.clone();
            let hub = self.hub.clone();
            let operation_id = operation_id.to_string();
            tokio::spawn(async move {
                ctx.op.mark_cancelled();
                ctx.upload.abort(&ctx.sftp).await;
                op_manager.finish(&operation_id);
                hub.send_sftp(TextFrame::SftpCancelled { operation_id }).await;
            });
        }
    }
}

async fn run_download(sftp: &SftpSession, path: &str, chunk_size: u32, hub: &TransportHub, op: &Operation) -> Result<u64> {
    let mut download = actions::download::Download::open(sftp, path).await?;
    let mut index = 0u32;
    let mut last_progress_at = Instant::now();

    loop {
        if op.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match download.read_chunk(index, chunk_size).await? {
            Some(chunk) => {
                let done = op.add_bytes(chunk.len() as u64);
                let header = serde_json::json!({ "operationId": op.operation_id });
                if !hub.send_sftp(BinaryFrame::new(BinaryFrameType::SftpFileData, header, chunk)).await {
                    return Err(GatewayError::Cancelled);
                }
                if last_progress_at.elapsed() >= Duration::from_millis(100) {
                    last_progress_at = Instant::now();
                    hub.send_sftp(TextFrame::SftpProgress { operation_id: op.operation_id.clone(), bytes_done: done, bytes_total: Some(download.total_size) })
                        .await;
                }
                index += 1;
            }
            None => break,
        }
    }
    Ok(download.total_size)
}

/// Shared `sftp.done` / `sftp.cancelled` / `sftp.failed` reporting for the
/// two streaming verbs (`download`, `downloadFolder`), which run detached
/// in their own tasks and can't go through `run_simple_op`. Also moves the
/// `Operation` into its terminal `OperationState` (spec §3) so a late
/// `sftp.cancel` or status query sees a state consistent with the wire
/// frame the client already received.
async fn report_stream_outcome<T>(hub: &TransportHub, op: &Operation, operation_id: String, result: Result<T>, to_result: impl FnOnce(T) -> Value) {
    match result {
        Ok(value) => {
            op.mark_done();
            hub.send_sftp(TextFrame::SftpDone { operation_id, result: to_result(value) }).await;
        }
        Err(GatewayError::Cancelled) => {
            op.mark_cancelled();
            hub.send_sftp(TextFrame::SftpCancelled { operation_id }).await;
        }
        Err(e) => {
            op.mark_failed(e.to_string());
            hub.send_sftp(TextFrame::SftpFailed { operation_id, code: e.wire_code(), message: e.to_string() }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_geometry_passes_in_range_values_through() {
        assert_eq!(clamp_geometry(1), 1);
        assert_eq!(clamp_geometry(80), 80);
        assert_eq!(clamp_geometry(500), 500);
    }

    #[test]
    fn clamp_geometry_caps_above_500() {
        assert_eq!(clamp_geometry(501), 500);
        assert_eq!(clamp_geometry(100_000), 500);
    }
}
