//! Workload-scheduler collaborator.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use capgrid_reconciler::BoxFuture;
use capgrid_state::{NodeId, NodeRecord, StateStore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{DisruptionError, DisruptionResult};

/// Moves workloads off a node.
pub trait Evictor: Send + Sync {
    /// Stop new workloads from landing on the node.
    fn cordon<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, DisruptionResult<()>>;

    /// Ask every workload on the node to leave within `grace`.
    fn evict<'a>(
        &'a self,
        node: &'a NodeRecord,
        grace: Duration,
    ) -> BoxFuture<'a, DisruptionResult<()>>;

    /// Non-system workloads still bound to the node.
    fn remaining<'a>(&'a self, node: &'a NodeId) -> BoxFuture<'a, DisruptionResult<usize>>;
}

/// Evictor for a real cluster scheduler that watches node states through
/// the API and reports workload sets back into the store.
///
/// Cordon and evict are implied by the `Draining` state; `remaining` reads
/// the last reported workload set.
#[derive(Clone)]
pub struct ReportedEvictor {
    state: StateStore,
}

impl ReportedEvictor {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

impl Evictor for ReportedEvictor {
    fn cordon<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, DisruptionResult<()>> {
        Box::pin(async move {
            debug!(node = %node.id, "cordon published via node state");
            Ok(())
        })
    }

    fn evict<'a>(
        &'a self,
        node: &'a NodeRecord,
        grace: Duration,
    ) -> BoxFuture<'a, DisruptionResult<()>> {
        Box::pin(async move {
            info!(
                node = %node.id,
                workloads = node.non_system_workloads(),
                grace_secs = grace.as_secs(),
                "eviction requested"
            );
            Ok(())
        })
    }

    fn remaining<'a>(&'a self, node: &'a NodeId) -> BoxFuture<'a, DisruptionResult<usize>> {
        Box::pin(async move {
            let record = self
                .state
                .get_node(node)?
                .ok_or_else(|| DisruptionError::NodeNotFound(node.clone()))?;
            Ok(record.non_system_workloads())
        })
    }
}

#[derive(Default)]
struct Recorded {
    cordoned: Vec<NodeId>,
    evictions: Vec<(NodeId, Duration)>,
    evicted_at: HashMap<NodeId, (Instant, usize)>,
    /// How long workloads take to reschedule once evicted, per node.
    reschedule: HashMap<NodeId, Duration>,
}

/// Simulated scheduler that records calls. Workloads vanish once their
/// node-specific reschedule time has passed since eviction.
#[derive(Default)]
pub struct RecordingEvictor {
    inner: Mutex<Recorded>,
}

impl RecordingEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workloads on `node` need `duration` to reschedule after eviction.
    pub fn with_reschedule_time(self, node: &str, duration: Duration) -> Self {
        self.inner
            .lock()
            .expect("evictor lock")
            .reschedule
            .insert(node.to_string(), duration);
        self
    }

    pub fn cordoned(&self) -> Vec<NodeId> {
        self.inner.lock().expect("evictor lock").cordoned.clone()
    }

    pub fn evictions(&self) -> Vec<(NodeId, Duration)> {
        self.inner.lock().expect("evictor lock").evictions.clone()
    }
}

impl Evictor for RecordingEvictor {
    fn cordon<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, DisruptionResult<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .expect("evictor lock")
                .cordoned
                .push(node.id.clone());
            Ok(())
        })
    }

    fn evict<'a>(
        &'a self,
        node: &'a NodeRecord,
        grace: Duration,
    ) -> BoxFuture<'a, DisruptionResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("evictor lock");
            inner.evictions.push((node.id.clone(), grace));
            inner
                .evicted_at
                .entry(node.id.clone())
                .or_insert((Instant::now(), node.non_system_workloads()));
            Ok(())
        })
    }

    fn remaining<'a>(&'a self, node: &'a NodeId) -> BoxFuture<'a, DisruptionResult<usize>> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("evictor lock");
            let Some((at, count)) = inner.evicted_at.get(node) else {
                return Ok(0);
            };
            let needed = inner.reschedule.get(node).copied().unwrap_or_default();
            if at.elapsed() >= needed {
                Ok(0)
            } else {
                Ok(*count)
            }
        })
    }
}
