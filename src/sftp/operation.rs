//! Operation bookkeeping: spec §4.4. Every `sftp.*` request except `cancel`
//! allocates one `Operation`, keyed by the client-supplied `operationId`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    List,
    Mkdir,
    Rename,
    Chmod,
    Delete,
    Upload,
    Download,
    DownloadFolder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Failed(String),
    Cancelled,
}

/// Tracks one in-flight SFTP operation for progress reporting and
/// cancellation (spec §4.4 `cancel`). `bytes_total` is `None` until the
/// transfer size is known (e.g. before the remote `stat` completes).
pub struct Operation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub path: String,
    pub bytes_total: Option<u64>,
    bytes_done: AtomicU64,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    state: Mutex<OperationState>,
}

impl Operation {
    pub fn new(operation_id: String, kind: OperationKind, path: String, bytes_total: Option<u64>) -> Self {
        Self {
            operation_id,
            kind,
            path,
            bytes_total,
            bytes_done: AtomicU64::new(0),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(OperationState::Running),
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_done.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current lifecycle state (spec §3 SFTP Operation `state`). Terminal
    /// states are final: once set, nothing moves the operation out of it.
    pub fn state(&self) -> OperationState {
        self.state.lock().expect("operation state lock poisoned").clone()
    }

    fn set_state(&self, state: OperationState) {
        *self.state.lock().expect("operation state lock poisoned") = state;
    }

    pub fn mark_done(&self) {
        self.set_state(OperationState::Done);
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        self.set_state(OperationState::Failed(message.into()));
    }

    pub fn mark_cancelled(&self) {
        self.set_state(OperationState::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_bytes_done_cumulatively() {
        let op = Operation::new("op1".into(), OperationKind::Upload, "/tmp/x".into(), Some(100));
        assert_eq!(op.add_bytes(40), 40);
        assert_eq!(op.add_bytes(60), 100);
        assert_eq!(op.bytes_done(), 100);
    }

    #[test]
    fn cancel_is_observable_through_the_token() {
        let op = Operation::new("op2".into(), OperationKind::Download, "/tmp/y".into(), None);
        assert!(!op.is_cancelled());
        op.cancel();
        assert!(op.is_cancelled());
        assert!(op.cancel.is_cancelled());
    }

    #[test]
    fn starts_running_and_moves_to_a_terminal_state() {
        let op = Operation::new("op3".into(), OperationKind::List, "/".into(), None);
        assert_eq!(op.state(), OperationState::Running);
        op.mark_done();
        assert_eq!(op.state(), OperationState::Done);
    }

    #[test]
    fn mark_failed_carries_the_message() {
        let op = Operation::new("op4".into(), OperationKind::Upload, "/tmp/z".into(), Some(10));
        op.mark_failed("disk full");
        assert_eq!(op.state(), OperationState::Failed("disk full".into()));
    }
}
