//! LocalStore: the redb-backed node store that a coordination service owns.
//!
//! Persistent nodes are written through redb write transactions; ephemeral
//! nodes, sequence counters, and live sessions are held in memory. A single
//! mutex over that volatile state is held for the whole of every mutation,
//! which makes `create` an atomic create-if-absent across both namespaces.
//!
//! Every mutation is stamped with a store-wide change id (`zxid`). Watchers
//! remember the id they started from and wait until the node, or one of its
//! direct children, is stamped with a later one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::path::{self, ROOT};
use crate::tables::NODES;

/// Convert any `Display` error into a `CoordError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CoordError::$variant(e.to_string())
    };
}

const EMPTY: &[u8] = &[];

/// Per-path change stamps kept before the oldest are folded into the horizon.
const CHANGE_LOG_CAPACITY: usize = 8192;

/// How a node is materialized, with the owning session id for ephemerals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "session", rename_all = "snake_case")]
pub enum NodeKind {
    Persistent,
    Ephemeral(u64),
    /// Ephemeral, with a ten-digit per-parent sequence number appended to the name.
    EphemeralSequential(u64),
}

impl NodeKind {
    fn owner(self) -> Option<u64> {
        match self {
            Self::Persistent => None,
            Self::Ephemeral(id) | Self::EphemeralSequential(id) => Some(id),
        }
    }
}

struct EphemeralNode {
    data: Vec<u8>,
    owner: u64,
}

#[derive(Default)]
struct Volatile {
    nodes: BTreeMap<String, EphemeralNode>,
    sequences: HashMap<String, u64>,
    sessions: HashSet<u64>,
}

/// Bounded record of which path changed at which zxid.
#[derive(Default)]
struct ChangeLog {
    zxid: u64,
    last: HashMap<String, u64>,
    order: VecDeque<(u64, String)>,
    /// Highest zxid whose stamps have been dropped.
    horizon: u64,
}

impl ChangeLog {
    fn record(&mut self, path: &str) -> u64 {
        self.zxid += 1;
        let zxid = self.zxid;
        for target in std::iter::once(path).chain(path::parent(path)) {
            self.last.insert(target.to_string(), zxid);
            self.order.push_back((zxid, target.to_string()));
        }
        while self.order.len() > CHANGE_LOG_CAPACITY {
            let Some((stamp, target)) = self.order.pop_front() else {
                break;
            };
            if self.last.get(&target) == Some(&stamp) {
                self.last.remove(&target);
            }
            self.horizon = stamp;
        }
        zxid
    }

    /// Whether `path` changed after `since`. Unknown paths older than the
    /// horizon answer yes, so a waiter may wake spuriously but never misses.
    fn changed_since(&self, path: &str, since: u64) -> bool {
        match self.last.get(path) {
            Some(stamp) => *stamp > since,
            None => since < self.horizon,
        }
    }
}

struct Inner {
    db: Database,
    volatile: Mutex<Volatile>,
    changes: Mutex<ChangeLog>,
    tick: watch::Sender<u64>,
    next_session: AtomicU64,
}

/// Thread-safe node store backed by redb.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("zxid", &self.zxid())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// redb holds an exclusive file lock, so exactly one process may own a
    /// store file; other managers reach it through the coordination service.
    pub fn open(path: &Path) -> CoordResult<Self> {
        let db = Database::create(path).map_err(map_err!(Connection))?;
        let store = Self::from_db(db)?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> CoordResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Connection))?;
        let store = Self::from_db(db)?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> CoordResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Connection))?;
        txn.open_table(NODES).map_err(map_err!(Connection))?;
        txn.commit().map_err(map_err!(Connection))?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                volatile: Mutex::new(Volatile::default()),
                changes: Mutex::new(ChangeLog::default()),
                tick: watch::channel(0).0,
                next_session: AtomicU64::new(1),
            }),
        })
    }

    fn volatile(&self) -> MutexGuard<'_, Volatile> {
        self.inner
            .volatile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn changes(&self) -> MutexGuard<'_, ChangeLog> {
        self.inner
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Register a session that ephemeral nodes can be bound to.
    pub fn open_session(&self) -> u64 {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.volatile().sessions.insert(id);
        debug!(session = id, "session opened");
        id
    }

    pub fn session_alive(&self, id: u64) -> bool {
        self.volatile().sessions.contains(&id)
    }

    /// End a session and remove every ephemeral node it owns. Unknown or
    /// already expired sessions are ignored.
    pub fn expire_session(&self, id: u64) {
        let removed: Vec<String> = {
            let mut volatile = self.volatile();
            if !volatile.sessions.remove(&id) {
                return;
            }
            let owned: Vec<String> = volatile
                .nodes
                .iter()
                .filter(|(_, node)| node.owner == id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                volatile.nodes.remove(path);
            }
            owned
        };
        for path in &removed {
            self.notify(path);
        }
        debug!(session = id, released = removed.len(), "session closed");
    }

    // ── Reads ──────────────────────────────────────────────────────

    fn read_persistent(&self, path: &str) -> CoordResult<Option<Vec<u8>>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Connection))?;
        let table = txn.open_table(NODES).map_err(map_err!(Connection))?;
        let value = table
            .get(path)
            .map_err(map_err!(Connection))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn persistent_exists(&self, path: &str) -> CoordResult<bool> {
        Ok(self.read_persistent(path)?.is_some())
    }

    pub fn exists(&self, path: &str) -> CoordResult<bool> {
        path::validate(path)?;
        if path == ROOT || self.volatile().nodes.contains_key(path) {
            return Ok(true);
        }
        self.persistent_exists(path)
    }

    /// Read a node's bytes.
    pub fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        path::validate(path)?;
        if path == ROOT {
            return Ok(Vec::new());
        }
        if let Some(node) = self.volatile().nodes.get(path) {
            return Ok(node.data.clone());
        }
        self.read_persistent(path)?
            .ok_or_else(|| CoordError::NotFound(path.to_string()))
    }

    /// Sorted names of the direct children of `path`.
    pub fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        if !self.exists(path)? {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let prefix = path::descendant_prefix(path);
        let mut names = BTreeSet::new();
        {
            let volatile = self.volatile();
            for (key, _) in volatile.nodes.range(prefix.clone()..) {
                if !key.starts_with(&prefix) {
                    break;
                }
                collect_child(&mut names, &key[prefix.len()..]);
            }
        }
        let txn = self.inner.db.begin_read().map_err(map_err!(Connection))?;
        let table = txn.open_table(NODES).map_err(map_err!(Connection))?;
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Connection))? {
            let (key, _) = entry.map_err(map_err!(Connection))?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            collect_child(&mut names, &key[prefix.len()..]);
        }
        Ok(names.into_iter().collect())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Write missing ancestors (and the node itself when `data` is given) in
    /// one transaction. Returns the ancestors that had to be created.
    fn write_persistent(
        &self,
        volatile: &Volatile,
        path: &str,
        data: Option<&[u8]>,
    ) -> CoordResult<Vec<String>> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Connection))?;
        let mut created = Vec::new();
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Connection))?;
            for ancestor in path::ancestors(path) {
                if volatile.nodes.contains_key(ancestor) {
                    return Err(CoordError::invalid(
                        path,
                        "ephemeral nodes cannot have children",
                    ));
                }
                if table.get(ancestor).map_err(map_err!(Connection))?.is_none() {
                    table
                        .insert(ancestor, EMPTY)
                        .map_err(map_err!(Connection))?;
                    created.push(ancestor.to_string());
                }
            }
            if let Some(data) = data {
                table.insert(path, data).map_err(map_err!(Connection))?;
            }
        }
        txn.commit().map_err(map_err!(Connection))?;
        Ok(created)
    }

    /// Replace a node's content. Missing nodes are created (with their
    /// parents) only when `create_if_absent` is set.
    pub fn set(&self, path: &str, data: &[u8], create_if_absent: bool) -> CoordResult<()> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::invalid(path, "the root holds no data"));
        }
        let created = {
            let mut volatile = self.volatile();
            if let Some(node) = volatile.nodes.get_mut(path) {
                node.data = data.to_vec();
                Vec::new()
            } else if self.persistent_exists(path)? || create_if_absent {
                self.write_persistent(&volatile, path, Some(data))?
            } else {
                return Err(CoordError::NotFound(path.to_string()));
            }
        };
        for ancestor in &created {
            self.notify(ancestor);
        }
        self.notify(path);
        debug!(path, bytes = data.len(), "node set");
        Ok(())
    }

    /// Atomically create a node that must not exist yet. Missing parents
    /// are created as empty persistent nodes. Returns the created path,
    /// which differs from `path` for sequential nodes.
    pub fn create(&self, path: &str, data: &[u8], kind: NodeKind) -> CoordResult<String> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        let (node_path, created) = {
            let mut volatile = self.volatile();
            if let Some(owner) = kind.owner() {
                if !volatile.sessions.contains(&owner) {
                    return Err(CoordError::SessionClosed(owner));
                }
            }
            let node_path = match kind {
                NodeKind::EphemeralSequential(_) => {
                    let parent = path::parent(path).unwrap_or(ROOT).to_string();
                    let counter = volatile.sequences.entry(parent).or_insert(0);
                    let seq = *counter;
                    *counter += 1;
                    format!("{path}{seq:010}")
                }
                _ => path.to_string(),
            };
            if volatile.nodes.contains_key(&node_path) || self.persistent_exists(&node_path)? {
                return Err(CoordError::NodeExists(node_path));
            }
            let created = match kind.owner() {
                None => self.write_persistent(&volatile, &node_path, Some(data))?,
                Some(owner) => {
                    let created = self.write_persistent(&volatile, &node_path, None)?;
                    volatile.nodes.insert(
                        node_path.clone(),
                        EphemeralNode {
                            data: data.to_vec(),
                            owner,
                        },
                    );
                    created
                }
            };
            (node_path, created)
        };
        for ancestor in &created {
            self.notify(ancestor);
        }
        self.notify(&node_path);
        debug!(path = %node_path, ephemeral = kind.owner().is_some(), "node created");
        Ok(node_path)
    }

    /// Create `path` (and its parents) as empty persistent nodes if absent.
    pub fn ensure_path(&self, path: &str) -> CoordResult<()> {
        path::validate(path)?;
        if path == ROOT {
            return Ok(());
        }
        let created = {
            let volatile = self.volatile();
            if volatile.nodes.contains_key(path) || self.persistent_exists(path)? {
                return Ok(());
            }
            let mut created = self.write_persistent(&volatile, path, Some(EMPTY))?;
            created.push(path.to_string());
            created
        };
        for p in &created {
            self.notify(p);
        }
        Ok(())
    }

    /// Delete a leaf node.
    pub fn delete(&self, path: &str) -> CoordResult<()> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::invalid(path, "the root cannot be deleted"));
        }
        {
            let mut volatile = self.volatile();
            if volatile.nodes.remove(path).is_none() {
                if !self.persistent_exists(path)? {
                    return Err(CoordError::NotFound(path.to_string()));
                }
                if self.has_children(&volatile, path)? {
                    return Err(CoordError::NotEmpty(path.to_string()));
                }
                let txn = self.inner.db.begin_write().map_err(map_err!(Connection))?;
                {
                    let mut table = txn.open_table(NODES).map_err(map_err!(Connection))?;
                    table.remove(path).map_err(map_err!(Connection))?;
                }
                txn.commit().map_err(map_err!(Connection))?;
            }
        }
        self.notify(path);
        debug!(path, "node deleted");
        Ok(())
    }

    fn has_children(&self, volatile: &Volatile, path: &str) -> CoordResult<bool> {
        let prefix = path::descendant_prefix(path);
        if let Some((key, _)) = volatile.nodes.range(prefix.clone()..).next() {
            if key.starts_with(&prefix) {
                return Ok(true);
            }
        }
        let txn = self.inner.db.begin_read().map_err(map_err!(Connection))?;
        let table = txn.open_table(NODES).map_err(map_err!(Connection))?;
        let mut range = table.range(prefix.as_str()..).map_err(map_err!(Connection))?;
        match range.next() {
            Some(entry) => {
                let (key, _) = entry.map_err(map_err!(Connection))?;
                Ok(key.value().starts_with(&prefix))
            }
            None => Ok(false),
        }
    }

    /// Delete `path` and everything beneath it. A missing path is a no-op.
    pub fn recursive_delete(&self, path: &str) -> CoordResult<()> {
        path::validate(path)?;
        let prefix = path::descendant_prefix(path);
        let removed = {
            let mut volatile = self.volatile();
            let mut removed: Vec<String> = volatile
                .nodes
                .keys()
                .filter(|key| key.as_str() == path || key.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &removed {
                volatile.nodes.remove(key);
            }

            let txn = self.inner.db.begin_write().map_err(map_err!(Connection))?;
            {
                let mut table = txn.open_table(NODES).map_err(map_err!(Connection))?;
                let mut keys = Vec::new();
                if path != ROOT && table.get(path).map_err(map_err!(Connection))?.is_some() {
                    keys.push(path.to_string());
                }
                for entry in table.range(prefix.as_str()..).map_err(map_err!(Connection))? {
                    let (key, _) = entry.map_err(map_err!(Connection))?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    keys.push(key.to_string());
                }
                for key in &keys {
                    table.remove(key.as_str()).map_err(map_err!(Connection))?;
                }
                removed.extend(keys);
            }
            txn.commit().map_err(map_err!(Connection))?;
            removed
        };
        for p in &removed {
            self.notify(p);
        }
        if !removed.is_empty() {
            debug!(path, removed = removed.len(), "subtree deleted");
        }
        Ok(())
    }

    // ── Change tracking ────────────────────────────────────────────

    /// The most recent change id.
    pub fn zxid(&self) -> u64 {
        self.changes().zxid
    }

    /// Wait until `path` or one of its direct children changes after
    /// `since`. Returns the change id to wait from next.
    pub async fn wait_change(&self, path: &str, since: u64) -> u64 {
        let mut tick = self.inner.tick.subscribe();
        loop {
            {
                let changes = self.changes();
                if changes.changed_since(path, since) {
                    return changes.zxid;
                }
            }
            if tick.changed().await.is_err() {
                return self.zxid();
            }
        }
    }

    fn notify(&self, path: &str) {
        let zxid = self.changes().record(path);
        self.inner.tick.send_replace(zxid);
    }
}

fn collect_child(names: &mut BTreeSet<String>, rest: &str) {
    if !rest.is_empty() && !rest.contains('/') {
        names.insert(rest.to_string());
    }
}
