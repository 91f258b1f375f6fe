//! Transaction manager - LIFO compensating actions for multi-step operations
//!
//! Each step of a multi-step operation registers a compensator before the
//! next step runs. `commit` discards the stack; `rollback` unwinds it in
//! reverse, running every compensator even when earlier ones fail.
//! Compensators must tolerate "already undone" conditions.

use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::domain::errors::SpinResult;

type Compensator = Box<dyn FnOnce() -> BoxFuture<'static, SpinResult<()>> + Send>;

struct RollbackStep {
    description: String,
    compensate: Compensator,
}

/// Ordered stack of compensating actions for one operation
#[derive(Default)]
pub struct Transaction {
    steps: Vec<RollbackStep>,
}

impl Transaction {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Register an undo action for the step that just completed
    pub fn add_rollback<F, Fut>(&mut self, description: impl Into<String>, compensate: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SpinResult<()>> + Send + 'static,
    {
        self.steps.push(RollbackStep {
            description: description.into(),
            compensate: Box::new(move || Box::pin(compensate())),
        });
    }

    /// Number of registered compensators still pending
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// The operation succeeded: discard every compensator
    pub fn commit(&mut self) {
        self.steps.clear();
    }

    /// Unwind in LIFO order. Per-step failures are logged and do not
    /// abort the remaining steps. Returns the number of failed steps.
    pub async fn rollback(&mut self) -> usize {
        if self.steps.is_empty() {
            return 0;
        }
        info!("↩️ Rolling back {} step(s)", self.steps.len());
        let mut failed = 0;
        while let Some(step) = self.steps.pop() {
            match (step.compensate)().await {
                Ok(()) => info!("↩️ Rolled back: {}", step.description),
                Err(err) => {
                    failed += 1;
                    error!("❌ Rollback step '{}' failed: {}", step.description, err);
                }
            }
        }
        if failed > 0 {
            warn!("⚠️ Rollback finished with {} failed step(s)", failed);
        }
        failed
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            // An abandoned transaction means the operation exited without
            // commit or rollback; surface it loudly in the logs
            warn!("⚠️ Transaction dropped with {} pending rollback step(s)", self.steps.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::errors::SpinError;

    #[tokio::test]
    async fn test_commit_discards_compensators() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::new();
        let h = Arc::clone(&hits);
        tx.add_rollback("undo step", move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tx.commit();
        assert_eq!(tx.rollback().await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rollback_runs_lifo() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        for step in 1..=3u32 {
            let order = Arc::clone(&order);
            tx.add_rollback(format!("step {step}"), move || async move {
                order.lock().unwrap().push(step);
                Ok(())
            });
        }
        tx.rollback().await;
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_abort_unwind() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::new();
        let h = Arc::clone(&hits);
        tx.add_rollback("first registered, last run", move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tx.add_rollback("failing step", || async {
            Err(SpinError::precondition("already undone"))
        });

        let failed = tx.rollback().await;
        assert_eq!(failed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
