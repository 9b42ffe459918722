//! redb table definitions for the coordination store.

use redb::TableDefinition;

/// Persistent nodes keyed by absolute path (`/fleetgrid/apps/web`).
///
/// Byte-wise key order puts every descendant of `/a` directly after `/a/`,
/// so child listing is a prefix range scan.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
