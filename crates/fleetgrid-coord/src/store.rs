//! CoordStore: the handle every manager uses to reach the shared store.
//!
//! A store is either the [`LocalStore`] this process owns or a
//! [`RemoteStore`] talking to the coordination service that owns it. Both
//! answer the same operations with the same errors, so records and locks
//! are written once against this type.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::RemoteStore;
use crate::error::{CoordError, CoordResult};
use crate::local::{LocalStore, NodeKind};
use crate::server::MAX_WAIT;

/// Floor for the remote heartbeat interval.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// How [`CoordStore::create`] materializes a node.
#[derive(Clone, Copy)]
pub enum CreateMode<'a> {
    Persistent,
    /// Removed when the session closes.
    Ephemeral(&'a Session),
    /// Ephemeral, with a ten-digit per-parent sequence number appended to the name.
    EphemeralSequential(&'a Session),
}

impl CreateMode<'_> {
    fn kind(self) -> NodeKind {
        match self {
            Self::Persistent => NodeKind::Persistent,
            Self::Ephemeral(session) => NodeKind::Ephemeral(session.id),
            Self::EphemeralSequential(session) => NodeKind::EphemeralSequential(session.id),
        }
    }
}

#[derive(Clone)]
enum Backend {
    Local(LocalStore),
    Remote(RemoteStore),
}

/// Cloneable handle over a local or remote coordination store.
#[derive(Clone)]
pub struct CoordStore {
    backend: Backend,
}

impl fmt::Debug for CoordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::Local(_) => f.debug_struct("CoordStore").field("backend", &"local").finish(),
            Backend::Remote(remote) => f
                .debug_struct("CoordStore")
                .field("backend", &"remote")
                .field("address", &remote.address())
                .finish(),
        }
    }
}

impl From<LocalStore> for CoordStore {
    fn from(store: LocalStore) -> Self {
        Self {
            backend: Backend::Local(store),
        }
    }
}

impl From<RemoteStore> for CoordStore {
    fn from(store: RemoteStore) -> Self {
        Self {
            backend: Backend::Remote(store),
        }
    }
}

impl CoordStore {
    /// Open (or create) a store file owned by this process.
    pub fn open(path: &Path) -> CoordResult<Self> {
        Ok(LocalStore::open(path)?.into())
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> CoordResult<Self> {
        Ok(LocalStore::open_in_memory()?.into())
    }

    /// Reach the coordination service at `endpoint` and check that it answers.
    pub async fn connect(endpoint: &str, timeout: Duration) -> CoordResult<Self> {
        let remote = RemoteStore::new(endpoint)?.with_timeout(timeout);
        let zxid = remote.zxid().await?;
        info!(address = %remote.address(), zxid, "coordination service reached");
        Ok(remote.into())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Open a session that ephemeral nodes can be bound to. Remote sessions
    /// are kept alive by a background heartbeat until closed or dropped.
    pub async fn session(&self) -> CoordResult<Session> {
        let closed = Arc::new(AtomicBool::new(false));
        match &self.backend {
            Backend::Local(store) => Ok(Session {
                id: store.open_session(),
                link: SessionLink::Local(store.clone()),
                closed,
            }),
            Backend::Remote(remote) => {
                let reply = remote.open_session().await?;
                let interval =
                    (Duration::from_millis(reply.timeout_ms) / 3).max(MIN_HEARTBEAT_INTERVAL);
                let keepalive = tokio::spawn(keep_alive(
                    remote.clone(),
                    reply.session,
                    interval,
                    closed.clone(),
                ));
                debug!(session = reply.session, ?interval, "remote session opened");
                Ok(Session {
                    id: reply.session,
                    link: SessionLink::Remote {
                        remote: remote.clone(),
                        keepalive,
                    },
                    closed,
                })
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn exists(&self, path: &str) -> CoordResult<bool> {
        match &self.backend {
            Backend::Local(store) => store.exists(path),
            Backend::Remote(remote) => remote.exists(path).await,
        }
    }

    /// Read a node's bytes.
    pub async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        match &self.backend {
            Backend::Local(store) => store.get(path),
            Backend::Remote(remote) => remote.get(path).await,
        }
    }

    /// Read and deserialize a JSON node.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CoordResult<T> {
        let bytes = self.get(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| CoordError::Deserialize(e.to_string()))
    }

    /// Sorted names of the direct children of `path`.
    pub async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        match &self.backend {
            Backend::Local(store) => store.children(path),
            Backend::Remote(remote) => remote.children(path).await,
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Replace a node's content. Missing nodes are created (with their
    /// parents) only when `create_if_absent` is set.
    pub async fn set(&self, path: &str, data: &[u8], create_if_absent: bool) -> CoordResult<()> {
        match &self.backend {
            Backend::Local(store) => store.set(path, data, create_if_absent),
            Backend::Remote(remote) => remote.set(path, data, create_if_absent).await,
        }
    }

    /// Serialize `value` as JSON and [`set`](Self::set) it.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        path: &str,
        value: &T,
        create_if_absent: bool,
    ) -> CoordResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| CoordError::Serialize(e.to_string()))?;
        self.set(path, &bytes, create_if_absent).await
    }

    /// Atomically create a node that must not exist yet. Missing parents
    /// are created as empty persistent nodes. Returns the created path,
    /// which differs from `path` for sequential nodes.
    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode<'_>,
    ) -> CoordResult<String> {
        let kind = mode.kind();
        match &self.backend {
            Backend::Local(store) => store.create(path, data, kind),
            Backend::Remote(remote) => remote.create(path, data, kind).await,
        }
    }

    /// Create `path` (and its parents) as empty persistent nodes if absent.
    pub async fn ensure_path(&self, path: &str) -> CoordResult<()> {
        match &self.backend {
            Backend::Local(store) => store.ensure_path(path),
            Backend::Remote(remote) => remote.ensure_path(path).await,
        }
    }

    /// Delete a leaf node.
    pub async fn delete(&self, path: &str) -> CoordResult<()> {
        match &self.backend {
            Backend::Local(store) => store.delete(path),
            Backend::Remote(remote) => remote.delete(path).await,
        }
    }

    /// Delete from a synchronous context: immediately for a local store,
    /// on a spawned task for a remote one.
    pub(crate) fn delete_detached(&self, path: String) {
        match &self.backend {
            Backend::Local(store) => {
                if let Err(e) = store.delete(&path) {
                    if !e.is_not_found() {
                        warn!(%path, error = %e, "detached delete failed");
                    }
                }
            }
            Backend::Remote(remote) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(%path, "no runtime for detached delete; left to session expiry");
                    return;
                };
                let remote = remote.clone();
                runtime.spawn(async move {
                    match remote.delete(&path).await {
                        Ok(()) => debug!(%path, "detached delete done"),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(%path, error = %e, "detached delete failed"),
                    }
                });
            }
        }
    }

    /// Delete `path` and everything beneath it. A missing path is a no-op.
    pub async fn recursive_delete(&self, path: &str) -> CoordResult<()> {
        match &self.backend {
            Backend::Local(store) => store.recursive_delete(path),
            Backend::Remote(remote) => remote.recursive_delete(path).await,
        }
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Watch `path` for creation, replacement, or deletion of the node or
    /// of any direct child. Changes made after this call are observed.
    pub async fn watch(&self, path: &str) -> CoordResult<NodeWatch> {
        let since = match &self.backend {
            Backend::Local(store) => store.zxid(),
            Backend::Remote(remote) => remote.zxid().await?,
        };
        Ok(NodeWatch {
            path: path.to_string(),
            since,
            backend: self.backend.clone(),
        })
    }
}

async fn keep_alive(remote: RemoteStore, id: u64, interval: Duration, closed: Arc<AtomicBool>) {
    loop {
        tokio::time::sleep(interval).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match remote.heartbeat(id).await {
            Ok(()) => {}
            Err(CoordError::SessionClosed(_)) => {
                warn!(session = id, "session expired by the coordination service");
                closed.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => warn!(session = id, error = %e, "heartbeat failed"),
        }
    }
}

/// Change notifications for one path.
pub struct NodeWatch {
    path: String,
    since: u64,
    backend: Backend,
}

impl NodeWatch {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change.
    pub async fn changed(&mut self) -> CoordResult<()> {
        match &self.backend {
            Backend::Local(store) => {
                self.since = store.wait_change(&self.path, self.since).await;
                Ok(())
            }
            Backend::Remote(remote) => loop {
                let reply = remote.wait(&self.path, self.since, MAX_WAIT).await?;
                if reply.fired {
                    self.since = reply.zxid;
                    return Ok(());
                }
            },
        }
    }
}

enum SessionLink {
    Local(LocalStore),
    Remote {
        remote: RemoteStore,
        keepalive: JoinHandle<()>,
    },
}

/// A client session. Ephemeral nodes created under it are removed when it
/// is closed, dropped, or (remotely) stops heartbeating.
pub struct Session {
    id: u64,
    link: SessionLink,
    closed: Arc<AtomicBool>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        match &self.link {
            SessionLink::Local(store) => {
                self.closed.load(Ordering::SeqCst) || !store.session_alive(self.id)
            }
            SessionLink::Remote { .. } => self.closed.load(Ordering::SeqCst),
        }
    }

    /// Close the session and remove its ephemeral nodes. Idempotent.
    pub async fn close(&self) -> CoordResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.link {
            SessionLink::Local(store) => {
                store.expire_session(self.id);
                Ok(())
            }
            SessionLink::Remote { remote, keepalive } => {
                keepalive.abort();
                remote.close_session(self.id).await
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.link {
            SessionLink::Local(store) => store.expire_session(self.id),
            SessionLink::Remote { remote, keepalive } => {
                keepalive.abort();
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let remote = remote.clone();
                let id = self.id;
                runtime.spawn(async move {
                    if let Err(e) = remote.close_session(id).await {
                        debug!(session = id, error = %e, "session close on drop failed");
                    }
                });
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn store() -> CoordStore {
        CoordStore::open_in_memory().unwrap()
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        port: u16,
    }

    #[tokio::test]
    async fn json_helpers() {
        let store = store();
        let record = Record {
            name: "web".into(),
            port: 49152,
        };
        store.set_json("/records/web", &record, true).await.unwrap();
        let back: Record = store.get_json("/records/web").await.unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn ephemeral_nodes_vanish_with_session() {
        let store = store();
        let session = store.session().await.unwrap();
        store
            .create("/live/m1", b"up", CreateMode::Ephemeral(&session))
            .await
            .unwrap();
        assert_eq!(store.children("/live").await.unwrap(), vec!["m1"]);
        drop(session);
        assert!(!store.exists("/live/m1").await.unwrap());
        assert!(store.exists("/live").await.unwrap());
    }

    #[tokio::test]
    async fn closed_session_cannot_create() {
        let store = store();
        let session = store.session().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.is_closed());
        let err = store
            .create("/x", b"", CreateMode::Ephemeral(&session))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn watch_fires_on_child_change() {
        let store = store();
        store.ensure_path("/w").await.unwrap();
        let mut watch = store.watch("/w").await.unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set("/w/child", b"1", true).await.unwrap();
        });
        tokio::time::timeout(Duration::from_secs(2), watch.changed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn watch_fires_on_delete() {
        let store = store();
        store.set("/w/node", b"", true).await.unwrap();
        let mut watch = store.watch("/w/node").await.unwrap();
        store.delete("/w/node").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watch.changed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn watch_ignores_changes_before_it_started() {
        let store = store();
        store.set("/w/old", b"", true).await.unwrap();
        let mut watch = store.watch("/w").await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), watch.changed()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn detached_delete_removes_local_node_at_once() {
        let store = store();
        store.set("/d/leaf", b"", true).await.unwrap();
        store.delete_detached("/d/leaf".to_string());
        assert!(!store.exists("/d/leaf").await.unwrap());
    }
}
