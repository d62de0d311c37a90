//! Per-repository mutual exclusion.
//!
//! A repository name is present in the table if and only if it is locked.
//! `lock` honours its timeout as a real bounded wait: a zero timeout fails
//! immediately on contention, a positive one waits for a release up to the
//! deadline. Contenders are not queued fairly; whoever re-checks first after
//! a release wins.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("repository {0} is already locked")]
    AlreadyLocked(String),
    #[error("repository {0} is not locked")]
    NotFound(String),
}

/// Named lock registry used to serialize writers to one repository.
#[async_trait]
pub trait RepositoryLock: Send + Sync {
    /// Take exclusive ownership of `name`, waiting at most `timeout` for a
    /// current holder to release it.
    async fn lock(&self, name: &str, timeout: Duration) -> Result<(), LockError>;

    /// Release `name`. Release never waits on other holders, so `timeout`
    /// only exists to keep the interface symmetric.
    async fn unlock(&self, name: &str, timeout: Duration) -> Result<(), LockError>;
}

#[derive(Debug, Default)]
pub struct LockTable {
    locks: RwLock<HashMap<String, bool>>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        self.locks.read().await.contains_key(name)
    }

    async fn try_lock(&self, name: &str) -> bool {
        let mut locks = self.locks.write().await;
        if locks.contains_key(name) {
            return false;
        }
        locks.insert(name.to_string(), true);
        true
    }
}

#[async_trait]
impl RepositoryLock for LockTable {
    async fn lock(&self, name: &str, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_lock(name).await {
                return Ok(());
            }
            if timeout.is_zero() || tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(LockError::AlreadyLocked(name.to_string()));
            }
        }
    }

    async fn unlock(&self, name: &str, _timeout: Duration) -> Result<(), LockError> {
        let removed = self.locks.write().await.remove(name);
        match removed {
            Some(_) => {
                self.released.notify_waiters();
                Ok(())
            }
            None => Err(LockError::NotFound(name.to_string())),
        }
    }
}
