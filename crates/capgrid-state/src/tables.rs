//! redb table definitions for the capgrid state store.
//!
//! String-keyed tables hold JSON-serialized domain types. The event log is
//! keyed by its sequence number so iteration order is emission order.

use redb::TableDefinition;

/// Node pool specs keyed by pool name.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Node records keyed by node id.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Pending workloads keyed by `{namespace}/{workload_id}`.
pub const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");

/// Append-only event log keyed by sequence number.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
