//! Registry: typed access to every record in the coordination store.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fleetgrid_coord::{CoordStore, DistributedLock, LockGuard, Session};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::crypto::Cipher;
use crate::error::{ModelError, ModelResult};
use crate::layout::Layout;
use crate::router_ports::PortRange;

/// Default store root.
pub const DEFAULT_ROOT: &str = "/fleetgrid";

/// Shared handle over the store, the manager's session, and model settings.
///
/// `Clone` is cheap; every record module hangs its operations off this type.
#[derive(Clone, Debug)]
pub struct Registry {
    store: CoordStore,
    session: Arc<Session>,
    layout: Layout,
    ports: PortRange,
    cipher: Cipher,
}

impl Registry {
    pub fn new(
        store: CoordStore,
        session: Arc<Session>,
        layout: Layout,
        ports: PortRange,
        cipher: Cipher,
    ) -> Self {
        Self {
            store,
            session,
            layout,
            ports,
            cipher,
        }
    }

    /// Registry over a fresh in-memory store (for testing).
    pub async fn in_memory() -> ModelResult<Self> {
        let store = CoordStore::open_in_memory()?;
        let session = Arc::new(store.session().await?);
        let registry = Self::new(
            store,
            session,
            Layout::new(DEFAULT_ROOT)?,
            PortRange::default(),
            Cipher::from_secret("in-memory"),
        );
        registry.bootstrap().await?;
        Ok(registry)
    }

    pub fn with_port_range(mut self, ports: PortRange) -> Self {
        self.ports = ports;
        self
    }

    pub fn store(&self) -> &CoordStore {
        &self.store
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn port_range(&self) -> PortRange {
        self.ports
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Create the base directory tree. Idempotent.
    pub async fn bootstrap(&self) -> ModelResult<()> {
        for path in self.layout.base_paths() {
            self.store.ensure_path(&path).await?;
        }
        info!(root = %self.layout.root(), "store layout ready");
        Ok(())
    }

    /// Acquire the named lock `<root>/locks/<name>`.
    pub(crate) async fn lock(&self, name: &str) -> ModelResult<LockGuard> {
        let lock = DistributedLock::new(
            self.store.clone(),
            self.session.clone(),
            self.layout.lock(name),
        );
        let guard = lock.acquire().await?;
        debug!(lock = name, "named lock held");
        Ok(guard)
    }

    pub(crate) async fn read_opt<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> ModelResult<Option<T>> {
        match self.store.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn read<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        name: &str,
        path: &str,
    ) -> ModelResult<T> {
        self.read_opt(path)
            .await?
            .ok_or_else(|| ModelError::not_found(kind, name))
    }

    /// Child names, or nothing when the directory does not exist yet.
    pub(crate) async fn children_or_empty(&self, path: &str) -> ModelResult<Vec<String>> {
        match self.store.children(path).await {
            Ok(children) => Ok(children),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_creates_base_paths() {
        let registry = Registry::in_memory().await.unwrap();
        for path in registry.layout().base_paths() {
            assert!(registry.store().exists(&path).await.unwrap(), "{path} missing");
        }
        registry.bootstrap().await.unwrap();
    }

    #[tokio::test]
    async fn named_lock_is_released_on_drop() {
        let registry = Registry::in_memory().await.unwrap();
        let dir = registry.layout().lock("demo");
        {
            let _guard = registry.lock("demo").await.unwrap();
            assert_eq!(registry.store().children(&dir).await.unwrap().len(), 1);
        }
        assert!(registry.store().children(&dir).await.unwrap().is_empty());
    }
}
