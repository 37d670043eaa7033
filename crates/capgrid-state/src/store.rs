//! StateStore: redb-backed state persistence for capgrid.
//!
//! Provides typed operations over node pools, node records, pending
//! workloads and the event log. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Every mutation of a node record happens in its own write transaction
//! that re-reads the record first, so concurrent control loops never
//! overwrite each other's lifecycle changes.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: serde::Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(PENDING).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a single pool spec.
    pub fn put_pool(&self, pool: &NodePoolSpec) -> StateResult<()> {
        let value = encode(pool)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            table
                .insert(pool.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %pool.name, "pool stored");
        Ok(())
    }

    /// Get a pool spec by name.
    pub fn get_pool(&self, name: &str) -> StateResult<Option<NodePoolSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOLS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all pool specs, ordered by name.
    pub fn list_pools(&self) -> StateResult<Vec<NodePoolSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOLS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Atomically replace the whole pool set (policy reload).
    pub fn replace_pools(&self, pools: &[NodePoolSpec]) -> StateResult<()> {
        let encoded = pools
            .iter()
            .map(|p| Ok((p.name.clone(), encode(p)?)))
            .collect::<StateResult<Vec<_>>>()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let existing: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in &existing {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (name, value) in &encoded {
                table
                    .insert(name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = pools.len(), "pool set replaced");
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Get a node record by id.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(node_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all node records (one consistent read snapshot).
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List node records owned by a pool.
    pub fn list_nodes_for_pool(&self, pool: &str) -> StateResult<Vec<NodeRecord>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.pool == pool)
            .collect())
    }

    /// Insert freshly provisioned nodes, enforcing the pool's `max_size`
    /// and shape eligibility in the same transaction.
    pub fn insert_nodes_bounded(
        &self,
        pool: &NodePoolSpec,
        nodes: &[NodeRecord],
    ) -> StateResult<()> {
        if let Some(bad) = nodes
            .iter()
            .find(|n| n.pool != pool.name || !pool.is_eligible(&n.shape))
        {
            return Err(StateError::IneligibleShape {
                pool: pool.name.clone(),
                shape: bad.shape.clone(),
            });
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut active = 0u32;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let node: NodeRecord = decode(value.value())?;
                if node.pool == pool.name && node.state.is_active() {
                    active += 1;
                }
            }
            let requested = nodes.len() as u32;
            if active + requested > pool.max_size {
                return Err(StateError::CapacityBound {
                    pool: pool.name.clone(),
                    max: pool.max_size,
                    active,
                    requested,
                });
            }
            for node in nodes {
                let value = encode(node)?;
                table
                    .insert(node.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %pool.name, count = nodes.len(), "nodes inserted");
        Ok(())
    }

    /// Compare-and-swap a node's lifecycle state.
    ///
    /// The transition is applied only if the node's current state is one
    /// of `from`; `mutate` may adjust other fields in the same write.
    pub fn transition_node(
        &self,
        node_id: &str,
        from: &[NodeState],
        to: NodeState,
        now: u64,
        mutate: impl FnOnce(&mut NodeRecord),
    ) -> StateResult<Transition> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current: Option<NodeRecord> = match table.get(node_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut node = current.ok_or_else(|| StateError::NotFound(node_id.to_string()))?;

            if !from.contains(&node.state) {
                outcome = Transition::Conflict { actual: node.state };
            } else {
                node.state = to;
                node.updated_at = now;
                mutate(&mut node);
                let value = encode(&node)?;
                table
                    .insert(node_id, value.as_slice())
                    .map_err(map_err!(Write))?;
                outcome = Transition::Applied(node);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, ?to, applied = outcome.applied(), "node transition");
        Ok(outcome)
    }

    /// Replace the workload set reported for a node.
    ///
    /// Draining and terminated nodes may only shed workloads, never gain
    /// new ones.
    pub fn set_node_workloads(
        &self,
        node_id: &str,
        workloads: Vec<AssignedWorkload>,
        now: u64,
    ) -> StateResult<NodeRecord> {
        self.update_node(node_id, |node| {
            if !node.state.accepts_workloads() {
                let gains_new = workloads
                    .iter()
                    .any(|w| !node.workloads.iter().any(|existing| existing.id == w.id));
                if gains_new {
                    return Err(StateError::NodeNotSchedulable {
                        node: node.id.clone(),
                        state: node.state,
                    });
                }
            }
            node.workloads = workloads;
            node.updated_at = now;
            if node.non_system_workloads() == 0 {
                node.empty_since.get_or_insert(now);
            } else {
                node.empty_since = None;
            }
            Ok(())
        })
    }

    /// Record a utilization sample and maintain `underutilized_since`
    /// against the owning pool's threshold.
    pub fn record_utilization(
        &self,
        node_id: &str,
        sample: UtilizationSample,
    ) -> StateResult<NodeRecord> {
        let threshold = {
            let node = self
                .get_node(node_id)?
                .ok_or_else(|| StateError::NotFound(node_id.to_string()))?;
            self.get_pool(&node.pool)?
                .map(|p| p.utilization_threshold)
                .unwrap_or(0.5)
        };
        self.update_node(node_id, |node| {
            if sample.peak() < threshold {
                node.underutilized_since.get_or_insert(sample.sampled_at);
            } else {
                node.underutilized_since = None;
            }
            node.utilization = Some(sample);
            Ok(())
        })
    }

    /// Read-modify-write a single node record in one transaction.
    fn update_node(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeRecord) -> StateResult<()>,
    ) -> StateResult<NodeRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let current: Option<NodeRecord> = match table.get(node_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut record = current.ok_or_else(|| StateError::NotFound(node_id.to_string()))?;
            f(&mut record)?;
            let value = encode(&record)?;
            table
                .insert(node_id, value.as_slice())
                .map_err(map_err!(Write))?;
            node = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(node)
    }

    /// Delete a node record. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Remove terminated records last updated before `older_than`.
    pub fn prune_terminated(&self, older_than: u64) -> StateResult<Vec<NodeId>> {
        let stale: Vec<NodeId> = self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.state == NodeState::Terminated && n.updated_at < older_than)
            .map(|n| n.id)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for id in &stale {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "terminated nodes pruned");
        }
        Ok(stale)
    }

    // ── Pending workloads ──────────────────────────────────────────

    /// Replace the full pending workload set with a fresh report.
    pub fn replace_pending(&self, workloads: &[PendingWorkload]) -> StateResult<()> {
        let encoded = workloads
            .iter()
            .map(|w| Ok((format!("{}/{}", w.namespace, w.id), encode(w)?)))
            .collect::<StateResult<Vec<_>>>()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PENDING).map_err(map_err!(Table))?;
            let existing: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for key in &existing {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = workloads.len(), "pending workloads replaced");
        Ok(())
    }

    /// List all pending workloads.
    pub fn list_pending(&self) -> StateResult<Vec<PendingWorkload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event, assigning the next sequence number.
    pub fn append_event(&self, kind: EventKind, at: u64) -> StateResult<Event> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let event;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let last = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            event = Event {
                seq: last + 1,
                at,
                kind,
            };
            let value = encode(&event)?;
            table
                .insert(event.seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(event)
    }

    /// Events with a sequence number strictly greater than `since`.
    pub fn events_since(&self, since: u64, limit: usize) -> StateResult<Vec<Event>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(since.saturating_add(1)..)
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Highest sequence number written so far (0 when empty).
    pub fn last_event_seq(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        Ok(table
            .last()
            .map_err(map_err!(Read))?
            .map(|(k, _)| k.value())
            .unwrap_or(0))
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
