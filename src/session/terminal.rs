//! Terminal Channel: spec §4.3. Binds one SSH PTY/shell channel to the
//! session's terminal command queue. Output backpressure is the Transport
//! Hub's job: `send_terminal` blocks once the terminal lane's queued bytes
//! cross `terminal_high_water` and doesn't unblock until they drain back
//! to `terminal_low_water` (hub.rs), which in turn stops this loop from
//! draining `channel.wait()`, which lets SSH's own channel window throttle
//! the remote shell. Grounded in the teacher's `ssh/connection.rs` +
//! `ssh/session.rs` request/select loop, adapted from WebSocket-to-server
//! relay to browser-to-SSH relay.

use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use russh::ChannelMsg;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::protocol::TextFrame;
use crate::ssh::ClientHandle;

use super::hub::TransportHub;

pub enum TerminalCommand {
    Input(Bytes),
    Resize { cols: u32, rows: u32 },
}

pub struct TerminalHandle {
    cmd_tx: mpsc::Sender<TerminalCommand>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl TerminalHandle {
    pub async fn send_input(&self, data: Bytes) -> bool {
        self.cmd_tx.send(TerminalCommand::Input(data)).await.is_ok()
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> bool {
        self.cmd_tx.send(TerminalCommand::Resize { cols, rows }).await.is_ok()
    }

    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

/// Opens a PTY and interactive shell on `handle` and spawns the task that
/// pumps data both directions until the remote shell exits or `shutdown`
/// is called.
pub async fn open(
    handle: Arc<ClientHandle>,
    hub: Arc<TransportHub>,
    cols: u32,
    rows: u32,
    term: Option<String>,
) -> Result<TerminalHandle> {
    let mut channel = handle.channel_open_session().await?;
    channel
        .request_pty(
            true,
            term.as_deref().unwrap_or("xterm-256color"),
            cols,
            rows,
            0,
            0,
            &[],
        )
        .await?;
    channel.request_shell(true).await?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
    let (stop_tx, mut stop_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut exit_code: Option<i32> = None;
        let mut exit_signal: Option<String> = None;
        let mut remote_closed = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    let _ = channel.close().await;
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(TerminalCommand::Input(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            warn!("terminal channel write failed: {e}");
                            break;
                        }
                    }
                    Some(TerminalCommand::Resize { cols, rows }) => {
                        if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                            warn!("terminal resize failed: {e}");
                        }
                    }
                    None => break,
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if !hub.send_terminal(Bytes::copy_from_slice(&data)).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        let _ = hub.send_terminal(Bytes::copy_from_slice(&data)).await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        exit_signal = Some(format!("{signal_name:?}"));
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        remote_closed = true;
                        break;
                    }
                    _ => {}
                },
            }
        }

        if remote_closed {
            hub.send_control(TextFrame::TerminalExit { code: exit_code, signal: exit_signal }).await;
        }
    });

    Ok(TerminalHandle { cmd_tx, stop_tx: Some(stop_tx) })
}
