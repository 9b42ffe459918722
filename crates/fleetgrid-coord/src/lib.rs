//! fleetgrid-coord: the coordination store every manager shares.
//!
//! Nodes are addressed by absolute, `/`-separated paths and hold opaque
//! bytes (JSON in practice). One process owns the store file
//! ([`LocalStore`], persistent nodes in a [redb](https://docs.rs/redb)
//! table keyed by full path) and serves it to every other manager through
//! the coordination service ([`server`]); those managers reach it with a
//! [`RemoteStore`]. [`CoordStore`] hides which of the two a caller holds.
//!
//! Ephemeral nodes are bound to a [`Session`] and vanish when it closes, is
//! dropped, or (for remote sessions) misses heartbeats past the service's
//! session timeout.
//!
//! # Primitives
//!
//! | Operation | Semantics |
//! |---|---|
//! | `get` / `set` | full-node read and replace, optional create-if-absent |
//! | `create` | atomic create-if-absent; persistent, ephemeral or ephemeral-sequential |
//! | `children` | sorted direct child names |
//! | `delete` / `recursive_delete` | leaf removal / subtree removal |
//! | `watch` | change notification for a node and its direct children |
//!
//! [`DistributedLock`] builds queue-based mutual exclusion on top of
//! ephemeral-sequential nodes.

pub mod client;
pub mod error;
pub mod local;
pub mod lock;
pub mod path;
pub mod server;
pub mod store;
pub mod tables;
pub mod wire;

pub use client::RemoteStore;
pub use error::{CoordError, CoordResult};
pub use local::{LocalStore, NodeKind};
pub use lock::{DistributedLock, LockGuard};
pub use server::{CoordService, DEFAULT_SESSION_TIMEOUT, run_reaper};
pub use store::{CoordStore, CreateMode, NodeWatch, Session};
