// Maintenance task locks and cooperative shutdown

use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Non-blocking per-task lock: a trigger that arrives while the previous
/// run is still going is skipped, never queued.
#[derive(Debug, Clone)]
pub struct TaskLock {
    name: String,
    inner: Arc<Mutex<()>>,
}

impl TaskLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guard for this run, or `None` if a run is already in progress
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        match self.inner.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("⏭️  Task '{}' still running, skipping this trigger", self.name);
                None
            }
        }
    }
}

/// Shutdown flag checked between ticks. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender: Arc::new(sender), receiver }
    }

    pub fn initiate_shutdown(&self) {
        if !self.is_shutting_down() {
            info!("🛑 Graceful shutdown initiated");
        }
        self.sender.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        // Err only if every sender is gone; the signal owns one, so it cannot be
        let _ = receiver.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_lock_skips_overlapping_runs() {
        let lock = TaskLock::new("reconcile");
        let guard = lock.try_acquire();
        assert!(guard.is_some());
        assert!(lock.clone().try_acquire().is_none());

        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        assert!(!signal.is_shutting_down());
        signal.initiate_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(signal.is_shutting_down());
    }
}
