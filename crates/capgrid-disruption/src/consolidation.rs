//! Consolidation: removing nodes that no longer earn their keep.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use capgrid_state::{
    DrainReason, NodeId, NodePoolSpec, NodeRecord, NodeState, PoolName, ScaleDownPolicy,
    StateStore,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::drainer::{DrainStart, Drainer};
use crate::error::{DisruptionError, DisruptionResult};

/// A node chosen for voluntary removal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainAction {
    pub node: NodeId,
    pub pool: PoolName,
    pub reason: DrainReason,
    pub grace_secs: u64,
    /// Peak utilization fraction; 0 for empty nodes.
    pub utilization: f64,
}

/// Pick at most one node per pool to drain, most underutilized first.
///
/// A node qualifies when it is `Ready`, every workload on it may migrate,
/// it has met its pool's scale-down condition for the whole window, and
/// removing it keeps the pool at or above `min_size`. A pool with a
/// consolidation drain already in flight is skipped.
pub fn plan(pools: &[NodePoolSpec], nodes: &[NodeRecord], now: u64) -> Vec<DrainAction> {
    let mut by_pool: BTreeMap<&str, Vec<&NodeRecord>> = BTreeMap::new();
    for node in nodes {
        by_pool.entry(node.pool.as_str()).or_default().push(node);
    }

    let mut actions = Vec::new();
    for pool in pools {
        let Some(members) = by_pool.get(pool.name.as_str()) else {
            continue;
        };

        let in_flight = members.iter().any(|n| {
            n.state == NodeState::Draining
                && n.drain
                    .as_ref()
                    .is_some_and(|d| d.reason == DrainReason::Consolidation)
        });
        if in_flight {
            debug!(pool = %pool.name, "consolidation drain already in flight");
            continue;
        }

        let serving = members
            .iter()
            .filter(|n| n.state.accepts_workloads())
            .count() as u32;
        if serving <= pool.min_size {
            continue;
        }

        let best = members
            .iter()
            .filter(|n| eligible(pool, n, now))
            .map(|n| (utilization(n), *n))
            .min_by(|(ua, a), (ub, b)| ua.total_cmp(ub).then_with(|| a.id.cmp(&b.id)));

        if let Some((utilization, node)) = best {
            actions.push(DrainAction {
                node: node.id.clone(),
                pool: pool.name.clone(),
                reason: DrainReason::Consolidation,
                grace_secs: pool.disruption_grace_secs,
                utilization,
            });
        }
    }

    actions.sort_by(|a, b| match a.utilization.total_cmp(&b.utilization) {
        Ordering::Equal => a.node.cmp(&b.node),
        other => other,
    });
    actions
}

fn eligible(pool: &NodePoolSpec, node: &NodeRecord, now: u64) -> bool {
    if node.state != NodeState::Ready || !node.all_migratable() {
        return false;
    }
    let sustained = |since: Option<u64>| {
        since.is_some_and(|t| now.saturating_sub(t) >= pool.consolidate_after_secs)
    };
    let empty = node.non_system_workloads() == 0 && sustained(node.empty_since);
    match pool.scale_down {
        ScaleDownPolicy::WhenEmpty => empty,
        ScaleDownPolicy::WhenUnderutilized => empty || sustained(node.underutilized_since),
    }
}

fn utilization(node: &NodeRecord) -> f64 {
    if node.non_system_workloads() == 0 {
        return 0.0;
    }
    node.utilization.map(|u| u.peak()).unwrap_or(1.0)
}

/// Runs the consolidation plan against the store and starts the drains.
#[derive(Clone)]
pub struct ConsolidationPlanner {
    state: StateStore,
    drainer: Drainer,
}

impl ConsolidationPlanner {
    pub fn new(state: StateStore, drainer: Drainer) -> Self {
        Self { state, drainer }
    }

    /// Plan without acting.
    pub fn preview(&self, now: u64) -> DisruptionResult<Vec<DrainAction>> {
        Ok(plan(&self.state.list_pools()?, &self.state.list_nodes()?, now))
    }

    /// Plan and start drains. Returns the actions whose drain actually began;
    /// a node that another drain claimed first is skipped.
    pub async fn run_once(&self, now: u64) -> DisruptionResult<Vec<DrainAction>> {
        let mut started = Vec::new();
        for action in self.preview(now)? {
            let grace = Duration::from_secs(action.grace_secs);
            let outcome = match self
                .drainer
                .start(&action.node, DrainReason::Consolidation, grace)
                .await
            {
                Ok(outcome) => outcome,
                // Another drain of the pool started since the plan was made.
                Err(DisruptionError::BelowMinSize { .. }) => {
                    debug!(node = %action.node, pool = %action.pool, "consolidation skipped at min_size");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match outcome {
                DrainStart::Started => {
                    info!(
                        node = %action.node,
                        pool = %action.pool,
                        utilization = action.utilization,
                        "consolidating node"
                    );
                    started.push(action);
                }
                other => debug!(node = %action.node, ?other, "consolidation skipped"),
            }
        }
        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use capgrid_feed::EventFeed;
    use capgrid_reconciler::SimulatedProvisioner;
    use capgrid_state::{AssignedWorkload, DrainInfo, EventKind, UtilizationSample};

    use crate::drainer::DrainConfig;
    use crate::evictor::RecordingEvictor;

    const MINUTE: u64 = 60;

    fn pool(name: &str, scale_down: ScaleDownPolicy, min_size: u32) -> NodePoolSpec {
        NodePoolSpec {
            name: name.to_string(),
            shapes: vec!["m.large".to_string()],
            min_size,
            max_size: 10,
            weight: 0,
            scale_down,
            utilization_threshold: 0.5,
            consolidate_after_secs: 10 * MINUTE,
            disruption_grace_secs: 300,
            taints: Vec::new(),
            labels: Default::default(),
        }
    }

    fn ready(id: &str, pool: &str) -> NodeRecord {
        let mut node = NodeRecord::provisioning(id, pool, "m.large", "zone-a", 0);
        node.state = NodeState::Ready;
        node
    }

    fn workload(id: &str, migratable: bool) -> AssignedWorkload {
        AssignedWorkload {
            id: id.to_string(),
            requests: Default::default(),
            system: false,
            migratable,
        }
    }

    fn busy(id: &str, pool: &str, peak: f64, under_since: Option<u64>) -> NodeRecord {
        let mut node = ready(id, pool);
        node.workloads.push(workload("w", true));
        node.empty_since = None;
        node.utilization = Some(UtilizationSample {
            cpu: peak,
            memory: 0.1,
            sampled_at: 0,
        });
        node.underutilized_since = under_since;
        node
    }

    #[test]
    fn empty_node_past_window_is_drained_once() {
        let pools = vec![pool("general", ScaleDownPolicy::WhenEmpty, 0)];
        let now = 11 * MINUTE;
        let nodes = vec![ready("n1", "general"), busy("n2", "general", 0.9, None)];

        let actions = plan(&pools, &nodes, now);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].node, "n1");
        assert_eq!(actions[0].grace_secs, 300);
        assert_eq!(actions[0].reason, DrainReason::Consolidation);
    }

    #[test]
    fn empty_node_inside_window_is_kept() {
        let pools = vec![pool("general", ScaleDownPolicy::WhenEmpty, 0)];
        let nodes = vec![ready("n1", "general")];
        assert!(plan(&pools, &nodes, 9 * MINUTE).is_empty());
    }

    #[test]
    fn at_most_one_node_per_pool() {
        let pools = vec![pool("general", ScaleDownPolicy::WhenEmpty, 0)];
        let nodes = vec![ready("n2", "general"), ready("n1", "general")];
        let actions = plan(&pools, &nodes, 20 * MINUTE);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].node, "n1");
    }

    #[test]
    fn min_size_is_respected() {
        let pools = vec![pool("general", ScaleDownPolicy::WhenEmpty, 2)];
        let nodes = vec![ready("n1", "general"), ready("n2", "general")];
        assert!(plan(&pools, &nodes, 20 * MINUTE).is_empty());
    }

    #[test]
    fn underutilized_picks_lowest_utilization() {
        let pools = vec![pool("batch", ScaleDownPolicy::WhenUnderutilized, 0)];
        let nodes = vec![
            busy("a", "batch", 0.4, Some(0)),
            busy("b", "batch", 0.2, Some(0)),
            busy("c", "batch", 0.1, None),
            busy("d", "batch", 0.8, None),
        ];
        let actions = plan(&pools, &nodes, 15 * MINUTE);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].node, "b");
        assert!((actions[0].utilization - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn when_empty_ignores_underutilized_nodes() {
        let pools = vec![pool("general", ScaleDownPolicy::WhenEmpty, 0)];
        let nodes = vec![busy("a", "general", 0.1, Some(0))];
        assert!(plan(&pools, &nodes, 60 * MINUTE).is_empty());
    }

    #[test]
    fn unmigratable_workloads_pin_the_node() {
        let pools = vec![pool("batch", ScaleDownPolicy::WhenUnderutilized, 0)];
        let mut node = busy("a", "batch", 0.1, Some(0));
        node.workloads = vec![workload("stateful", false)];
        assert!(plan(&pools, &[node], 60 * MINUTE).is_empty());
    }

    #[test]
    fn in_flight_consolidation_blocks_pool() {
        let pools = vec![
            pool("general", ScaleDownPolicy::WhenEmpty, 0),
            pool("batch", ScaleDownPolicy::WhenEmpty, 0),
        ];
        let mut draining = ready("n1", "general");
        draining.state = NodeState::Draining;
        draining.drain = Some(DrainInfo {
            reason: DrainReason::Consolidation,
            started_at: 0,
            grace_secs: 300,
            interrupted: false,
        });
        let nodes = vec![draining, ready("n2", "general"), ready("b1", "batch")];

        let actions = plan(&pools, &nodes, 20 * MINUTE);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].pool, "batch");
    }

    #[test]
    fn plan_is_deterministic() {
        let pools = vec![
            pool("general", ScaleDownPolicy::WhenEmpty, 0),
            pool("batch", ScaleDownPolicy::WhenUnderutilized, 0),
        ];
        let nodes = vec![
            ready("g1", "general"),
            busy("b1", "batch", 0.3, Some(0)),
            busy("b2", "batch", 0.3, Some(0)),
        ];
        let first = plan(&pools, &nodes, 30 * MINUTE);
        assert_eq!(first, plan(&pools, &nodes, 30 * MINUTE));
        let order: Vec<&str> = first.iter().map(|a| a.node.as_str()).collect();
        assert_eq!(order, vec!["g1", "b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_drains_and_terminates() {
        let state = StateStore::open_in_memory().unwrap();
        let general = pool("general", ScaleDownPolicy::WhenEmpty, 0);
        state.put_pool(&general).unwrap();
        state
            .insert_nodes_bounded(&general, &[ready("n1", "general")])
            .unwrap();

        let feed = EventFeed::new(state.clone());
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let drainer = Drainer::new(
            state.clone(),
            feed,
            Arc::new(RecordingEvictor::new()),
            provisioner.clone(),
            DrainConfig::default(),
        );
        let planner = ConsolidationPlanner::new(state.clone(), drainer.clone());

        let started = planner.run_once(11 * MINUTE).await.unwrap();
        assert_eq!(started.len(), 1);
        assert!(planner.run_once(11 * MINUTE).await.unwrap().is_empty());

        drainer.wait("n1").await;
        assert_eq!(
            state.get_node("n1").unwrap().unwrap().state,
            NodeState::Terminated
        );
        let drains = state
            .events_since(0, 100)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::DrainStarted { .. }))
            .count();
        assert_eq!(drains, 1);
    }
}
