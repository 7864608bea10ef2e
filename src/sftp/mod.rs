//! SFTP Operation Manager: spec §4.4. One manager per session, shared by the
//! session's text-frame dispatch loop and its binary-frame (upload/download
//! payload) loop.

pub mod actions;
pub mod operation;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::error::{GatewayError, Result};
pub use operation::{Operation, OperationKind, OperationState};

/// Registers in-flight operations by `operationId` and bounds how many can
/// run concurrently per session (`MAX_CONCURRENT_OPS`, spec §6.3).
pub struct OperationManager {
    operations: DashMap<String, Arc<Operation>>,
    concurrency: Arc<Semaphore>,
}

impl OperationManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            operations: DashMap::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Acquires a concurrency slot and registers the operation under its id.
    /// The returned permit must be held for the operation's lifetime; the
    /// `Operation` itself is reachable via `get` for as long as it's
    /// registered, independent of the permit.
    pub async fn begin(
        &self,
        operation_id: String,
        kind: OperationKind,
        path: String,
        bytes_total: Option<u64>,
    ) -> Result<(Arc<Operation>, tokio::sync::OwnedSemaphorePermit)> {
        if self.operations.contains_key(&operation_id) {
            return Err(GatewayError::Protocol(format!("duplicate operationId {operation_id}")));
        }
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GatewayError::Anyhow(anyhow::anyhow!(e)))?;
        let op = Arc::new(Operation::new(operation_id.clone(), kind, path, bytes_total));
        self.operations.insert(operation_id, op.clone());
        Ok((op, permit))
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<Operation>> {
        self.operations.get(operation_id).map(|e| e.clone())
    }

    /// `sftp.cancel`: flips the operation's cancellation token. The owning
    /// task observes it at the next chunk/entry boundary and tears down.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.operations.get(operation_id) {
            Some(op) => {
                op.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, operation_id: &str) {
        self.operations.remove(operation_id);
    }

    /// Cancels every operation still registered. Called on session teardown
    /// so a closing session doesn't leave detached upload/download/
    /// downloadFolder tasks running against a socket nobody is draining
    /// anymore (spec §4.1, §5).
    pub fn cancel_all(&self) {
        for entry in self.operations.iter() {
            entry.value().cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_rejects_duplicate_operation_ids() {
        let mgr = OperationManager::new(4);
        mgr.begin("op1".into(), OperationKind::List, "/".into(), None).await.unwrap();
        let err = mgr.begin("op1".into(), OperationKind::List, "/".into(), None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn cancel_returns_false_for_unknown_operation() {
        let mgr = OperationManager::new(4);
        assert!(!mgr.cancel("nope"));
    }

    #[tokio::test]
    async fn finish_makes_the_operation_unreachable() {
        let mgr = OperationManager::new(4);
        let (op, _permit) = mgr.begin("op1".into(), OperationKind::Mkdir, "/a".into(), None).await.unwrap();
        assert!(mgr.get(&op.operation_id).is_some());
        mgr.finish(&op.operation_id);
        assert!(mgr.get("op1").is_none());
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_registered_operation() {
        let mgr = OperationManager::new(4);
        let (op_a, _permit_a) = mgr.begin("a".into(), OperationKind::Download, "/a".into(), None).await.unwrap();
        let (op_b, _permit_b) = mgr.begin("b".into(), OperationKind::Upload, "/b".into(), None).await.unwrap();
        assert!(!op_a.is_cancelled());
        assert!(!op_b.is_cancelled());
        mgr.cancel_all();
        assert!(op_a.is_cancelled());
        assert!(op_b.is_cancelled());
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_a_third_operation() {
        let mgr = OperationManager::new(2);
        let (_op_a, permit_a) = mgr.begin("a".into(), OperationKind::List, "/".into(), None).await.unwrap();
        let (_op_b, permit_b) = mgr.begin("b".into(), OperationKind::List, "/".into(), None).await.unwrap();
        assert_eq!(mgr.concurrency.available_permits(), 0);
        drop(permit_a);
        assert_eq!(mgr.concurrency.available_permits(), 1);
        drop(permit_b);
    }
}
