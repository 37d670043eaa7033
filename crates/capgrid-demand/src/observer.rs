use std::collections::BTreeMap;

use capgrid_state::{
    NodeId, NodeState, PendingWorkload, PoolName, ResourceVector, StateResult, StateStore,
    UtilizationSample, Urgency, WorkloadClass, epoch_secs,
};
use serde::Serialize;
use tracing::debug;

/// Aggregated pending demand for one (class, urgency) bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemandVector {
    pub class: WorkloadClass,
    pub urgency: Urgency,
    /// Sum of all pending requests.
    pub total: ResourceVector,
    /// Component-wise largest single request; a node must fit this.
    pub per_unit: ResourceVector,
    pub workloads: u32,
}

/// Utilization view of one active node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUsage {
    pub node: NodeId,
    pub pool: PoolName,
    pub state: NodeState,
    pub allocated: ResourceVector,
    pub utilization: Option<UtilizationSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemandSnapshot {
    pub taken_at: u64,
    pub demand: Vec<DemandVector>,
    pub nodes: Vec<NodeUsage>,
}

/// Fold pending workloads into per-bucket demand, ordered by class then
/// urgency.
pub fn aggregate(pending: &[PendingWorkload]) -> Vec<DemandVector> {
    let mut buckets: BTreeMap<(WorkloadClass, Urgency), DemandVector> = BTreeMap::new();
    for workload in pending {
        if workload.requests.is_zero() {
            continue;
        }
        let bucket = buckets
            .entry((workload.class, workload.urgency))
            .or_insert_with(|| DemandVector {
                class: workload.class,
                urgency: workload.urgency,
                total: ResourceVector::ZERO,
                per_unit: ResourceVector::ZERO,
                workloads: 0,
            });
        bucket.total += workload.requests;
        bucket.per_unit = bucket.per_unit.max(&workload.requests);
        bucket.workloads += 1;
    }
    buckets.into_values().collect()
}

#[derive(Clone)]
pub struct DemandObserver {
    state: StateStore,
}

impl DemandObserver {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Current pending demand.
    pub fn observe(&self) -> StateResult<Vec<DemandVector>> {
        let pending = self.state.list_pending()?;
        let demand = aggregate(&pending);
        debug!(
            pending = pending.len(),
            buckets = demand.len(),
            "demand observed"
        );
        Ok(demand)
    }

    /// Demand plus per-node utilization of active nodes.
    pub fn snapshot(&self) -> StateResult<DemandSnapshot> {
        let demand = self.observe()?;
        let nodes = self
            .state
            .list_nodes()?
            .into_iter()
            .filter(|n| n.state.is_active())
            .map(|n| NodeUsage {
                allocated: n.allocated(),
                node: n.id,
                pool: n.pool,
                state: n.state,
                utilization: n.utilization,
            })
            .collect();
        Ok(DemandSnapshot {
            taken_at: epoch_secs(),
            demand,
            nodes,
        })
    }
}
