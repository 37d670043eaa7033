//! Applies scale actions against the provisioning API.
//!
//! Every action is announced on the feed exactly once. Scale-ups for the
//! same pool run one after another; different pools proceed concurrently.
//! Each provider call is bounded by `call_timeout`. Throttling and
//! unavailability are retried with exponential backoff up to
//! `max_attempts`; quota errors and timeouts fail the action for this
//! cycle and are picked up again by the next reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use capgrid_config::CapacityCatalog;
use capgrid_feed::EventFeed;
use capgrid_state::{
    CapacityShape, EventKind, NodeId, NodePoolSpec, NodeRecord, NodeState, ShapeId, StateStore,
    epoch_secs,
};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::plan::ScaleAction;
use crate::provisioner::{ProvisionedNode, Provisioner};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Mark nodes Ready as soon as they are recorded (simulated provider).
    pub mark_ready: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            mark_ready: false,
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Applied {
        pool: String,
        shape: ShapeId,
        nodes: Vec<NodeId>,
        attempts: u32,
    },
    Failed {
        pool: String,
        shape: ShapeId,
        count: u32,
        error: ProvisionError,
        attempts: u32,
    },
    /// A shortfall was surfaced; nothing to apply.
    Reported,
}

struct Job {
    pool: NodePoolSpec,
    shape: CapacityShape,
    count: u32,
}

#[derive(Clone)]
pub struct ActionExecutor {
    state: StateStore,
    feed: EventFeed,
    provisioner: Arc<dyn Provisioner>,
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(
        state: StateStore,
        feed: EventFeed,
        provisioner: Arc<dyn Provisioner>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            state,
            feed,
            provisioner,
            config,
        }
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    /// Announce and apply a batch of actions.
    pub async fn execute(
        &self,
        actions: Vec<ScaleAction>,
        pools: &[NodePoolSpec],
        catalog: &CapacityCatalog,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        let mut by_pool: BTreeMap<String, Vec<Job>> = BTreeMap::new();

        for action in actions {
            if let Err(e) = self.feed.emit(action.to_event()) {
                warn!(error = %e, "failed to record planned action");
            }
            let ScaleAction::ScaleUp {
                pool, shape, count, ..
            } = action
            else {
                outcomes.push(ActionOutcome::Reported);
                continue;
            };

            let spec = pools.iter().find(|p| p.name == pool);
            let capacity = catalog.get(&shape);
            match (spec, capacity) {
                (Some(spec), Some(capacity)) => {
                    by_pool.entry(pool).or_default().push(Job {
                        pool: spec.clone(),
                        shape: capacity.clone(),
                        count,
                    });
                }
                _ => {
                    let error = ProvisionError::State(format!(
                        "pool {pool} or shape {shape} not in the active policy"
                    ));
                    outcomes.push(self.fail(pool, shape, count, error, 0));
                }
            }
        }

        let mut set = JoinSet::new();
        for jobs in by_pool.into_values() {
            let exec = self.clone();
            set.spawn(async move {
                let mut done = Vec::with_capacity(jobs.len());
                for job in jobs {
                    done.push(exec.run_job(&job).await);
                }
                done
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => outcomes.extend(done),
                Err(e) => error!(error = %e, "scale-up task panicked"),
            }
        }
        outcomes
    }

    async fn run_job(&self, job: &Job) -> ActionOutcome {
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let call = self.provisioner.provision(&job.pool, &job.shape, job.count);
            match timeout(self.config.call_timeout, call).await {
                Ok(Ok(nodes)) => break self.record(&job.pool, &job.shape, nodes).await,
                Ok(Err(e)) if e.is_retryable() && attempts < self.config.max_attempts => {
                    let delay = self.config.backoff(attempts);
                    warn!(
                        pool = %job.pool.name,
                        shape = %job.shape.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provisioning failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => break Err(e),
                Err(_) => break Err(ProvisionError::TimedOut(self.config.call_timeout)),
            }
        };

        match result {
            Ok(nodes) => {
                info!(
                    pool = %job.pool.name,
                    shape = %job.shape.id,
                    count = nodes.len(),
                    attempts,
                    "scale-up applied"
                );
                if let Err(e) = self.feed.emit(EventKind::ScaleUpApplied {
                    pool: job.pool.name.clone(),
                    shape: job.shape.id.clone(),
                    nodes: nodes.clone(),
                    attempts,
                }) {
                    warn!(error = %e, "failed to record scale-up");
                }
                ActionOutcome::Applied {
                    pool: job.pool.name.clone(),
                    shape: job.shape.id.clone(),
                    nodes,
                    attempts,
                }
            }
            Err(error) => self.fail(
                job.pool.name.clone(),
                job.shape.id.clone(),
                job.count,
                error,
                attempts,
            ),
        }
    }

    fn fail(
        &self,
        pool: String,
        shape: ShapeId,
        count: u32,
        error: ProvisionError,
        attempts: u32,
    ) -> ActionOutcome {
        error!(%pool, %shape, count, attempts, error = %error, "scale-up failed");
        if let Err(e) = self.feed.emit(EventKind::ScaleUpFailed {
            pool: pool.clone(),
            shape: shape.clone(),
            count,
            reason: error.to_string(),
            timed_out: error.is_timeout(),
        }) {
            warn!(error = %e, "failed to record scale-up failure");
        }
        ActionOutcome::Failed {
            pool,
            shape,
            count,
            error,
            attempts,
        }
    }

    /// Persist provisioned nodes under the pool bound. Capacity the store
    /// refuses is handed back to the provider.
    async fn record(
        &self,
        pool: &NodePoolSpec,
        shape: &CapacityShape,
        nodes: Vec<ProvisionedNode>,
    ) -> ProvisionResult<Vec<NodeId>> {
        let now = epoch_secs();
        let records: Vec<NodeRecord> = nodes
            .iter()
            .map(|n| NodeRecord::provisioning(&n.id, &pool.name, &shape.id, &n.zone, now))
            .collect();

        if let Err(e) = self.state.insert_nodes_bounded(pool, &records) {
            warn!(pool = %pool.name, error = %e, "rejecting provisioned nodes");
            for record in &records {
                match timeout(self.config.call_timeout, self.provisioner.terminate(record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(node = %record.id, error = %err, "release failed"),
                    Err(_) => warn!(node = %record.id, "release timed out"),
                }
            }
            return Err(e.into());
        }

        if self.config.mark_ready {
            for record in &records {
                self.state.transition_node(
                    &record.id,
                    &[NodeState::Provisioning],
                    NodeState::Ready,
                    now,
                    |_| {},
                )?;
            }
        }
        Ok(records.into_iter().map(|r| r.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::SimulatedProvisioner;
    use capgrid_state::{
        PurchaseMode, ResourceVector, ScaleDownPolicy, ShortfallReason, Urgency, WorkloadClass,
    };

    fn pool(name: &str, max: u32) -> NodePoolSpec {
        NodePoolSpec {
            name: name.to_string(),
            shapes: vec!["m.large.spot".to_string()],
            min_size: 0,
            max_size: max,
            weight: 0,
            scale_down: ScaleDownPolicy::WhenEmpty,
            utilization_threshold: 0.5,
            consolidate_after_secs: 600,
            disruption_grace_secs: 300,
            taints: Vec::new(),
            labels: Default::default(),
        }
    }

    fn catalog() -> CapacityCatalog {
        CapacityCatalog::new([CapacityShape {
            id: "m.large.spot".to_string(),
            cpu_millis: 4000,
            memory_mib: 16_384,
            gpus: 0,
            gpu_type: None,
            purchase: PurchaseMode::Spot,
            zones: vec!["zone-a".to_string()],
            hourly_cost: 0.06,
        }])
    }

    fn scale_up(pool: &str, count: u32) -> ScaleAction {
        ScaleAction::ScaleUp {
            pool: pool.to_string(),
            shape: "m.large.spot".to_string(),
            count,
            class: Some(WorkloadClass::General),
            urgency: Some(Urgency::Standard),
        }
    }

    struct Harness {
        state: StateStore,
        feed: EventFeed,
        sim: Arc<SimulatedProvisioner>,
        exec: ActionExecutor,
    }

    fn harness(sim: SimulatedProvisioner, config: ExecutorConfig) -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        let feed = EventFeed::new(state.clone());
        let sim = Arc::new(sim);
        let exec = ActionExecutor::new(state.clone(), feed.clone(), sim.clone(), config);
        Harness {
            state,
            feed,
            sim,
            exec,
        }
    }

    fn event_names(feed: &EventFeed) -> Vec<&'static str> {
        feed.since(0, 100)
            .unwrap()
            .into_iter()
            .map(|e| e.kind.name())
            .collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ExecutorConfig {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(3),
            ..ExecutorConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(3));
        assert_eq!(config.backoff(40), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn applies_scale_up_and_records_nodes() {
        let h = harness(
            SimulatedProvisioner::new(),
            ExecutorConfig {
                mark_ready: true,
                ..ExecutorConfig::default()
            },
        );
        let pools = vec![pool("general", 5)];

        let outcomes = h
            .exec
            .execute(vec![scale_up("general", 2)], &pools, &catalog())
            .await;

        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Applied { nodes, attempts: 1, .. }] if nodes.len() == 2
        ));
        let nodes = h.state.list_nodes_for_pool("general").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.state == NodeState::Ready));
        assert_eq!(event_names(&h.feed), vec!["scale_up_planned", "scale_up_applied"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let sim = SimulatedProvisioner::new();
        sim.fail_next(ProvisionError::Throttled("rate limit".to_string()));
        sim.fail_next(ProvisionError::Unavailable("zone-a dry".to_string()));
        let h = harness(sim, ExecutorConfig::default());

        let outcomes = h
            .exec
            .execute(vec![scale_up("general", 1)], &[pool("general", 5)], &catalog())
            .await;

        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Applied { attempts: 3, .. }]
        ));
        assert_eq!(h.sim.provision_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let sim = SimulatedProvisioner::new();
        for _ in 0..10 {
            sim.fail_next(ProvisionError::Unavailable("dry".to_string()));
        }
        let h = harness(sim, ExecutorConfig::default());

        let outcomes = h
            .exec
            .execute(vec![scale_up("general", 1)], &[pool("general", 5)], &catalog())
            .await;

        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Failed { attempts: 4, .. }]
        ));
        assert_eq!(h.sim.provision_calls(), 4);
        assert!(h.state.list_nodes().unwrap().is_empty());
        assert_eq!(event_names(&h.feed), vec!["scale_up_planned", "scale_up_failed"]);
    }

    #[tokio::test]
    async fn quota_errors_are_not_retried() {
        let h = harness(SimulatedProvisioner::new().with_quota(1), ExecutorConfig::default());

        let outcomes = h
            .exec
            .execute(vec![scale_up("general", 3)], &[pool("general", 5)], &catalog())
            .await;

        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Failed {
                error: ProvisionError::QuotaExceeded(_),
                attempts: 1,
                ..
            }]
        ));
        assert_eq!(h.sim.provision_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let h = harness(
            SimulatedProvisioner::new().with_latency(Duration::from_secs(60)),
            ExecutorConfig {
                call_timeout: Duration::from_secs(5),
                ..ExecutorConfig::default()
            },
        );

        let outcomes = h
            .exec
            .execute(vec![scale_up("general", 1)], &[pool("general", 5)], &catalog())
            .await;

        assert!(matches!(
            &outcomes[..],
            [ActionOutcome::Failed {
                error: ProvisionError::TimedOut(_),
                attempts: 1,
                ..
            }]
        ));
        let failed = h.feed.since(1, 10).unwrap();
        assert!(matches!(
            failed[0].kind,
            EventKind::ScaleUpFailed { timed_out: true, .. }
        ));
    }

    #[tokio::test]
    async fn store_bound_rejects_and_releases_nodes() {
        let h = harness(SimulatedProvisioner::new(), ExecutorConfig::default());
        let pools = vec![pool("general", 1)];
        h.state
            .insert_nodes_bounded(
                &pools[0],
                &[NodeRecord::provisioning("existing", "general", "m.large.spot", "zone-a", 0)],
            )
            .unwrap();

        let outcomes = h.exec.execute(vec![scale_up("general", 1)], &pools, &catalog()).await;

        assert!(matches!(&outcomes[..], [ActionOutcome::Failed { .. }]));
        assert_eq!(h.sim.terminated(), vec!["general-00001".to_string()]);
        assert_eq!(h.state.list_nodes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shortfalls_are_reported_once() {
        let h = harness(SimulatedProvisioner::new(), ExecutorConfig::default());
        let shortfall = ScaleAction::Shortfall {
            class: WorkloadClass::General,
            urgency: Urgency::Standard,
            pool: Some("general".to_string()),
            missing_nodes: 4,
            unmet: ResourceVector::new(16_000, 0, 0),
            reason: ShortfallReason::PoolAtMax,
        };

        let outcomes = h
            .exec
            .execute(vec![shortfall], &[pool("general", 5)], &catalog())
            .await;

        assert_eq!(outcomes, vec![ActionOutcome::Reported]);
        assert_eq!(event_names(&h.feed), vec!["capacity_shortfall"]);
        assert_eq!(h.sim.provision_calls(), 0);
    }

    #[tokio::test]
    async fn pools_are_applied_independently() {
        let h = harness(SimulatedProvisioner::new(), ExecutorConfig::default());
        let pools = vec![pool("a", 5), pool("b", 5)];

        let outcomes = h
            .exec
            .execute(
                vec![scale_up("a", 1), scale_up("b", 2), scale_up("a", 1)],
                &pools,
                &catalog(),
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(h.state.list_nodes_for_pool("a").unwrap().len(), 2);
        assert_eq!(h.state.list_nodes_for_pool("b").unwrap().len(), 2);
    }
}
