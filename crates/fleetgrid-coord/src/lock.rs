//! Named distributed locks over ephemeral-sequential nodes.
//!
//! Each contender creates `lock-NNNNNNNNNN` under the lock directory and
//! waits until its node is the lowest in the queue, watching only its
//! immediate predecessor. Nodes are ephemeral, so a holder whose session
//! ends releases the lock with it.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::path;
use crate::store::{CoordStore, CreateMode, Session};

const LOCK_PREFIX: &str = "lock-";

/// A named mutual-exclusion lock rooted at one store directory.
#[derive(Clone)]
pub struct DistributedLock {
    store: CoordStore,
    session: Arc<Session>,
    dir: String,
}

impl DistributedLock {
    pub fn new(store: CoordStore, session: Arc<Session>, dir: impl Into<String>) -> Self {
        Self {
            store,
            session,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Block until the lock is held. There is no timeout; see
    /// [`acquire_timeout`](Self::acquire_timeout) for a bounded wait.
    ///
    /// Dropping the returned future before it resolves withdraws from the
    /// queue.
    pub async fn acquire(&self) -> CoordResult<LockGuard> {
        self.store.ensure_path(&self.dir).await?;
        let node = self
            .store
            .create(
                &path::join(&self.dir, LOCK_PREFIX),
                &[],
                CreateMode::EphemeralSequential(&self.session),
            )
            .await?;
        let guard = LockGuard {
            store: self.store.clone(),
            node: Some(node),
        };
        let own = path::name(guard.path()).to_string();

        loop {
            let queue: Vec<String> = self
                .store
                .children(&self.dir)
                .await?
                .into_iter()
                .filter(|name| name.starts_with(LOCK_PREFIX))
                .collect();
            let Some(position) = queue.iter().position(|name| *name == own) else {
                // Our node is gone: the session expired underneath us.
                return Err(CoordError::SessionClosed(self.session.id()));
            };
            if position == 0 {
                debug!(lock = %self.dir, node = %own, "lock acquired");
                return Ok(guard);
            }

            let predecessor = path::join(&self.dir, &queue[position - 1]);
            let mut watch = self.store.watch(&predecessor).await?;
            if !self.store.exists(&predecessor).await? {
                continue;
            }
            watch.changed().await?;
        }
    }

    /// [`acquire`](Self::acquire) with a bounded wait.
    pub async fn acquire_timeout(&self, timeout: Duration) -> CoordResult<LockGuard> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(CoordError::LockTimeout(self.dir.clone())),
        }
    }
}

/// Proof of lock ownership. The lock is released on drop.
#[derive(Debug)]
pub struct LockGuard {
    store: CoordStore,
    node: Option<String>,
}

impl LockGuard {
    /// Queue node backing this guard, empty once released.
    pub fn path(&self) -> &str {
        self.node.as_deref().unwrap_or_default()
    }

    /// Release the lock. Calling it again is a no-op.
    pub async fn release(&mut self) -> CoordResult<()> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        match self.store.delete(&node).await {
            Ok(()) => {
                debug!(%node, "lock released");
                Ok(())
            }
            // Session already gone, and the node with it.
            Err(CoordError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            debug!(%node, "lock released on drop");
            self.store.delete_detached(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    async fn lock(store: &CoordStore, name: &str) -> DistributedLock {
        DistributedLock::new(store.clone(), Arc::new(store.session().await.unwrap()), name)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let store = CoordStore::open_in_memory().unwrap();
        let lock = lock(&store, "/locks/ports").await;
        let mut guard = lock.acquire().await.unwrap();
        assert_eq!(store.children("/locks/ports").await.unwrap().len(), 1);
        guard.release().await.unwrap();
        guard.release().await.unwrap();
        assert!(store.children("/locks/ports").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drop_releases() {
        let store = CoordStore::open_in_memory().unwrap();
        let lock = lock(&store, "/locks/drop").await;
        {
            let _guard = lock.acquire().await.unwrap();
        }
        let _again = lock
            .acquire_timeout(Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn panic_while_holding_releases() {
        let store = CoordStore::open_in_memory().unwrap();
        let session = Arc::new(store.session().await.unwrap());
        let holder = DistributedLock::new(store.clone(), session.clone(), "/locks/panic");
        let task = tokio::spawn(async move {
            let _guard = holder.acquire().await.unwrap();
            panic!("critical section failed");
        });
        let joined = task.await;
        assert!(joined.unwrap_err().is_panic());
        // The holder's session outlives the task; only the guard was dropped.
        assert!(!session.is_closed());

        let waiter = lock(&store, "/locks/panic").await;
        let mut guard = waiter
            .acquire_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(store.children("/locks/panic").await.unwrap().len(), 1);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_times_out_and_withdraws() {
        let store = CoordStore::open_in_memory().unwrap();
        let holder = lock(&store, "/locks/busy").await;
        let waiter = lock(&store, "/locks/busy").await;
        let _held = holder.acquire().await.unwrap();
        let err = waiter
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::LockTimeout(_)));
        assert_eq!(store.children("/locks/busy").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn holder_session_death_releases() {
        let store = CoordStore::open_in_memory().unwrap();
        let session = Arc::new(store.session().await.unwrap());
        let holder = DistributedLock::new(store.clone(), session.clone(), "/locks/death");
        let guard = holder.acquire().await.unwrap();
        std::mem::forget(guard);
        session.close().await.unwrap();

        let waiter = lock(&store, "/locks/death").await;
        waiter
            .acquire_timeout(Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutual_exclusion_under_contention() {
        let store = CoordStore::open_in_memory().unwrap();
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock(&store, "/locks/shared").await;
            let inside = inside.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _guard = lock.acquire().await.unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.store(false, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 40);
        assert!(store.children("/locks/shared").await.unwrap().is_empty());
    }
}
