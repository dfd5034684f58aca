use std::sync::Arc;
use tablesnap_core::{Error, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Non-blocking mutual exclusion for mutating operations.
///
/// There is no wait queue: a second caller fails immediately with
/// [`Error::LockContention`] instead of waiting for the first to finish.
#[derive(Clone, Default)]
pub struct OperationLock {
    inner: Arc<Mutex<()>>,
}

/// Held for the duration of one operation; releases on drop.
pub struct OperationGuard {
    operation: String,
    _guard: OwnedMutexGuard<()>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, operation: &str) -> Result<OperationGuard> {
        let guard = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::LockContention {
                operation: operation.to_string(),
            })?;
        debug!(operation, "Operation lock acquired");
        Ok(OperationGuard {
            operation: operation.to_string(),
            _guard: guard,
        })
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl OperationGuard {
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        debug!(operation = %self.operation, "Operation lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let lock = OperationLock::new();
        let guard = lock.try_acquire("upload").unwrap();
        assert_eq!(guard.operation(), "upload");
        assert!(lock.is_held());

        let err = lock.try_acquire("download").err().unwrap();
        assert!(matches!(err, Error::LockContention { ref operation } if operation == "download"));

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire("download").is_ok());
    }

    #[tokio::test]
    async fn test_released_when_task_panics() {
        let lock = OperationLock::new();
        let shared = lock.clone();
        let task = tokio::spawn(async move {
            let _guard = shared.try_acquire("restore").unwrap();
            panic!("restore blew up");
        });
        assert!(task.await.is_err());
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_contention_across_tasks() {
        let lock = OperationLock::new();
        let guard = lock.try_acquire("create").unwrap();

        let other = lock.clone();
        let rejected = tokio::spawn(async move { other.try_acquire("clean").is_err() })
            .await
            .unwrap();
        assert!(rejected);

        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(guard);
        let other = lock.clone();
        let accepted = tokio::spawn(async move { other.try_acquire("clean").is_ok() })
            .await
            .unwrap();
        assert!(accepted);
    }
}
