//! The controller: shared handles plus the periodic loops.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use capgrid_config::{CompiledPolicy, PolicyDocument};
use capgrid_demand::{DemandObserver, DemandVector};
use capgrid_disruption::{
    ConsolidationPlanner, DrainAction, DrainStart, Drainer, Evictor, InterruptionHandler,
};
use capgrid_feed::{EventFeed, render_prometheus};
use capgrid_policy::{EffectivePolicy, Ingress, RequestContext};
use capgrid_reconciler::{ActionExecutor, ActionOutcome, Provisioner, Reconciler, ScaleAction};
use capgrid_state::{
    AssignedWorkload, DrainReason, Event, EventKind, NodeId, NodeRecord, NodeState,
    PendingWorkload, StateError, StateStore, Transition, UtilizationSample, epoch_secs,
};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ControlError, ControlResult};

/// Result of one reconcile pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub demand: Vec<DemandVector>,
    pub actions: Vec<ScaleAction>,
    pub nodes_added: Vec<NodeId>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Node count per lifecycle state.
    pub nodes: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySummary {
    pub shapes: usize,
    pub pools: usize,
    pub traffic_policies: usize,
    pub gateway_rules: usize,
}

impl PolicySummary {
    fn of(policy: &CompiledPolicy) -> Self {
        Self {
            shapes: policy.catalog.len(),
            pools: policy.pools.len(),
            traffic_policies: policy.traffic.len(),
            gateway_rules: policy.gateway.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pools: Vec<PoolStatus>,
    pub nodes: Vec<NodeRecord>,
    pub pending_workloads: usize,
    pub demand: Vec<DemandVector>,
    pub draining: Vec<NodeId>,
    pub policy: PolicySummary,
    pub last_event_seq: u64,
}

struct Shared {
    state: StateStore,
    feed: EventFeed,
    observer: DemandObserver,
    executor: ActionExecutor,
    drainer: Drainer,
    planner: ConsolidationPlanner,
    interruptions: InterruptionHandler,
    policy: RwLock<Arc<CompiledPolicy>>,
    config: ControllerConfig,
    reconcile: Arc<Notify>,
    /// Serializes reconcile passes.
    cycle: Mutex<()>,
}

/// Owns every component. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Shared>,
}

impl Controller {
    /// Wire the components. Nothing is written until `apply_policy`.
    pub fn new(
        state: StateStore,
        policy: CompiledPolicy,
        config: ControllerConfig,
        provisioner: Arc<dyn Provisioner>,
        evictor: Arc<dyn Evictor>,
    ) -> Self {
        let feed = EventFeed::new(state.clone());
        let reconcile = Arc::new(Notify::new());
        let executor = ActionExecutor::new(
            state.clone(),
            feed.clone(),
            provisioner.clone(),
            config.executor.clone(),
        );
        let drainer = Drainer::new(
            state.clone(),
            feed.clone(),
            evictor,
            provisioner,
            config.drain.clone(),
        );
        let planner = ConsolidationPlanner::new(state.clone(), drainer.clone());
        let interruptions = InterruptionHandler::new(
            state.clone(),
            feed.clone(),
            drainer.clone(),
            reconcile.clone(),
        );

        Self {
            inner: Arc::new(Shared {
                observer: DemandObserver::new(state.clone()),
                state,
                feed,
                executor,
                drainer,
                planner,
                interruptions,
                policy: RwLock::new(Arc::new(policy)),
                config,
                reconcile,
                cycle: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn feed(&self) -> &EventFeed {
        &self.inner.feed
    }

    pub fn drainer(&self) -> &Drainer {
        &self.inner.drainer
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<CompiledPolicy> {
        self.inner.policy.read().expect("policy lock").clone()
    }

    /// Ask the reconcile loop for a pass now.
    pub fn request_reconcile(&self) {
        self.inner.reconcile.notify_one();
    }

    // ── Policy ─────────────────────────────────────────────────────

    /// Make a compiled policy the running one.
    ///
    /// The policy is checked against live nodes first; on any conflict
    /// nothing changes.
    pub fn apply_policy(
        &self,
        policy: CompiledPolicy,
        source: &str,
    ) -> ControlResult<PolicySummary> {
        let errors = policy.check_live_nodes(&self.inner.state.list_nodes()?);
        if !errors.is_empty() {
            self.policy_failed(source, errors.clone());
            return Err(ControlError::Rejected(errors));
        }

        self.inner.state.replace_pools(&policy.pools)?;
        let summary = PolicySummary::of(&policy);
        *self.inner.policy.write().expect("policy lock") = Arc::new(policy);

        info!(
            %source,
            pools = summary.pools,
            traffic_policies = summary.traffic_policies,
            "policy applied"
        );
        self.inner.feed.emit(EventKind::PolicyApplied {
            pools: summary.pools,
            traffic_policies: summary.traffic_policies,
        })?;
        self.request_reconcile();
        Ok(summary)
    }

    /// Load, validate and apply a policy document from disk.
    pub fn reload(&self, path: &Path) -> ControlResult<PolicySummary> {
        let source = path.display().to_string();
        match PolicyDocument::load(path) {
            Ok(policy) => self.apply_policy(policy, &source),
            Err(e) => {
                self.policy_failed(&source, e.messages());
                Err(e.into())
            }
        }
    }

    fn policy_failed(&self, source: &str, errors: Vec<String>) {
        warn!(%source, errors = errors.len(), "policy rejected");
        if let Err(e) = self.inner.feed.emit(EventKind::PolicyValidationFailed {
            source: source.to_string(),
            errors,
        }) {
            error!(error = %e, "failed to record policy rejection");
        }
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Observe demand, plan scale-ups and, unless `dry_run`, apply them.
    /// A dry run writes nothing and emits no events.
    pub async fn reconcile_once(&self, dry_run: bool) -> ControlResult<ReconcileReport> {
        let _cycle = self.inner.cycle.lock().await;
        let policy = self.policy();

        let demand = self.inner.observer.observe()?;
        let pools = self.inner.state.list_pools()?;
        let nodes = self.inner.state.list_nodes()?;
        let actions =
            Reconciler::new(&policy.catalog, &policy.classes).reconcile(&demand, &pools, &nodes);

        let mut report = ReconcileReport {
            dry_run,
            demand,
            actions: actions.clone(),
            nodes_added: Vec::new(),
            failures: Vec::new(),
        };
        if dry_run || actions.is_empty() {
            debug!(dry_run, actions = report.actions.len(), "reconcile planned");
            return Ok(report);
        }

        for outcome in self
            .inner
            .executor
            .execute(actions, &pools, &policy.catalog)
            .await
        {
            match outcome {
                ActionOutcome::Applied { nodes, .. } => report.nodes_added.extend(nodes),
                ActionOutcome::Failed {
                    pool,
                    shape,
                    count,
                    error,
                    attempts,
                } => report.failures.push(format!(
                    "{pool}/{shape} x{count}: {error} (after {attempts} attempt(s))"
                )),
                ActionOutcome::Reported => {}
            }
        }
        info!(
            added = report.nodes_added.len(),
            failed = report.failures.len(),
            "reconcile applied"
        );
        Ok(report)
    }

    // ── Disruption ─────────────────────────────────────────────────

    /// Resume orphaned drains, start consolidation drains and prune old
    /// terminated records.
    pub async fn consolidate_once(&self, now: u64) -> ControlResult<Vec<DrainAction>> {
        let resumed = self.inner.drainer.resume_orphans().await?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "orphaned drains resumed");
        }
        let started = self.inner.planner.run_once(now).await?;
        let cutoff = now.saturating_sub(self.inner.config.prune_after.as_secs());
        self.inner.state.prune_terminated(cutoff)?;
        Ok(started)
    }

    /// Operator-requested drain. Refused below `min_size` unless `force`.
    pub async fn manual_drain(
        &self,
        node_id: &str,
        force: bool,
        grace: Option<Duration>,
    ) -> ControlResult<DrainStart> {
        let node = self.node(node_id)?;
        let grace = grace.unwrap_or_else(|| {
            self.policy()
                .pool(&node.pool)
                .map(|p| Duration::from_secs(p.disruption_grace_secs))
                .unwrap_or_default()
        });
        let drainer = &self.inner.drainer;
        let outcome = if force {
            drainer.start_forced(node_id, DrainReason::Manual, grace).await?
        } else {
            drainer.start(node_id, DrainReason::Manual, grace).await?
        };
        Ok(outcome)
    }

    /// The provider reclaims `node_id` after `deadline`.
    pub async fn interruption(
        &self,
        node_id: &str,
        deadline: Duration,
    ) -> ControlResult<DrainStart> {
        Ok(self
            .inner
            .interruptions
            .on_interruption_notice(node_id, deadline)
            .await?)
    }

    // ── Reports from the cluster ───────────────────────────────────

    /// A provisioned node joined the cluster. Idempotent.
    pub fn mark_ready(&self, node_id: &str) -> ControlResult<NodeRecord> {
        let transition = self
            .inner
            .state
            .transition_node(
                node_id,
                &[NodeState::Provisioning],
                NodeState::Ready,
                epoch_secs(),
                |_| {},
            )
            .map_err(|e| node_error(e, node_id))?;
        match transition {
            Transition::Applied(node) => {
                info!(node = %node_id, pool = %node.pool, "node ready");
                Ok(node)
            }
            Transition::Conflict {
                actual: NodeState::Ready,
            } => self.node(node_id),
            Transition::Conflict { actual } => Err(ControlError::InvalidState {
                node: node_id.to_string(),
                state: actual,
                expected: NodeState::Provisioning,
            }),
        }
    }

    pub fn report_workloads(
        &self,
        node_id: &str,
        workloads: Vec<AssignedWorkload>,
    ) -> ControlResult<NodeRecord> {
        self.inner
            .state
            .set_node_workloads(node_id, workloads, epoch_secs())
            .map_err(|e| node_error(e, node_id))
    }

    pub fn report_utilization(
        &self,
        node_id: &str,
        sample: UtilizationSample,
    ) -> ControlResult<NodeRecord> {
        self.inner
            .state
            .record_utilization(node_id, sample)
            .map_err(|e| node_error(e, node_id))
    }

    /// Replace the pending workload set. Returns its size.
    pub fn report_pending(&self, workloads: &[PendingWorkload]) -> ControlResult<usize> {
        self.inner.state.replace_pending(workloads)?;
        debug!(count = workloads.len(), "pending workloads reported");
        Ok(workloads.len())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn node(&self, node_id: &str) -> ControlResult<NodeRecord> {
        self.inner
            .state
            .get_node(node_id)?
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))
    }

    pub async fn status(&self) -> ControlResult<StatusReport> {
        let policy = self.policy();
        let nodes = self.inner.state.list_nodes()?;
        let pools = self
            .inner
            .state
            .list_pools()?
            .into_iter()
            .map(|pool| {
                let mut counts = BTreeMap::new();
                for node in nodes.iter().filter(|n| n.pool == pool.name) {
                    *counts.entry(node.state.to_string()).or_insert(0) += 1;
                }
                PoolStatus {
                    name: pool.name,
                    min_size: pool.min_size,
                    max_size: pool.max_size,
                    nodes: counts,
                }
            })
            .collect();

        Ok(StatusReport {
            pools,
            pending_workloads: self.inner.state.list_pending()?.len(),
            demand: self.inner.observer.observe()?,
            draining: self.inner.drainer.active().await,
            policy: PolicySummary::of(&policy),
            last_event_seq: self.inner.feed.last_seq()?,
            nodes,
        })
    }

    pub fn resolve(&self, source_namespace: &str, dest_namespace: &str) -> EffectivePolicy {
        self.policy()
            .traffic
            .resolve(source_namespace, dest_namespace)
    }

    pub fn resolve_request(&self, ctx: &RequestContext<'_>) -> EffectivePolicy {
        self.policy().traffic.resolve_request(ctx)
    }

    pub fn ingress(&self, host: &str) -> Ingress {
        self.policy().gateway.ingress(host)
    }

    pub fn events(&self, since: u64, limit: usize) -> ControlResult<Vec<Event>> {
        Ok(self.inner.feed.since(since, limit)?)
    }

    /// Prometheus text exposition.
    pub fn metrics(&self) -> ControlResult<String> {
        let pools = self.inner.state.list_pools()?;
        let nodes = self.inner.state.list_nodes()?;
        Ok(render_prometheus(&self.inner.feed.counters(), &pools, &nodes))
    }

    // ── Loops ──────────────────────────────────────────────────────

    /// Run the reconcile and disruption loops until `shutdown` flips.
    /// In-flight drains are aborted on exit and resumed on the next start.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            observe_interval_secs = self.inner.config.observe_interval.as_secs(),
            consolidation_interval_secs = self.inner.config.consolidation_interval.as_secs(),
            "controller started"
        );
        match self.inner.drainer.resume_orphans().await {
            Ok(resumed) if !resumed.is_empty() => {
                info!(count = resumed.len(), "orphaned drains resumed");
            }
            Err(e) => error!(error = %e, "failed to resume drains"),
            _ => {}
        }

        let reconcile = tokio::spawn({
            let this = self.clone();
            let shutdown = shutdown.clone();
            async move { this.reconcile_loop(shutdown).await }
        });
        let disruption = tokio::spawn({
            let this = self.clone();
            async move { this.disruption_loop(shutdown).await }
        });

        let _ = reconcile.await;
        let _ = disruption.await;
        self.inner.drainer.stop_all().await;
        info!("controller stopped");
    }

    async fn reconcile_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.reconcile_once(false).await {
                error!(error = %e, "reconcile pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.observe_interval) => {}
                _ = self.inner.reconcile.notified() => {
                    debug!("out-of-band reconcile requested");
                }
                _ = shutdown.changed() => {
                    info!("reconcile loop shutting down");
                    break;
                }
            }
        }
    }

    async fn disruption_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.consolidation_interval) => {
                    match self.consolidate_once(epoch_secs()).await {
                        Ok(started) if !started.is_empty() => {
                            info!(count = started.len(), "consolidation drains started");
                        }
                        Err(e) => error!(error = %e, "consolidation pass failed"),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    info!("disruption loop shutting down");
                    break;
                }
            }
        }
    }
}

fn node_error(err: StateError, node_id: &str) -> ControlError {
    match err {
        StateError::NotFound(_) => ControlError::NodeNotFound(node_id.to_string()),
        other => ControlError::State(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_config::ConfigError;
    use capgrid_disruption::{DisruptionError, RecordingEvictor};
    use capgrid_reconciler::SimulatedProvisioner;
    use capgrid_state::{ResourceVector, Urgency, WorkloadClass};

    const POLICY: &str = r#"
[[shapes]]
id = "m.large"
cpu_millis = 4000
memory_mib = 16384
purchase = "spot"
zones = ["zone-a", "zone-b"]
hourly_cost = 0.1

[[pools]]
name = "general"
shapes = ["m.large"]
min_size = 0
max_size = 5
scale_down = "when-empty"

[[mesh.policies]]
mtls = "strict"
"#;

    fn compile(doc: &str) -> CompiledPolicy {
        PolicyDocument::parse(doc).unwrap().compile().unwrap()
    }

    fn controller_with(doc: &str, auto_ready: bool) -> Controller {
        let policy = compile(doc);
        let mut config = ControllerConfig::from_settings(&policy.settings);
        config.executor.mark_ready = auto_ready;
        let controller = Controller::new(
            StateStore::open_in_memory().unwrap(),
            policy.clone(),
            config,
            Arc::new(SimulatedProvisioner::new()),
            Arc::new(RecordingEvictor::new()),
        );
        controller.apply_policy(policy, "test").unwrap();
        controller
    }

    fn controller() -> Controller {
        controller_with(POLICY, true)
    }

    fn pending(id: &str, cpu_millis: u64) -> PendingWorkload {
        PendingWorkload {
            id: id.to_string(),
            namespace: "web".to_string(),
            class: WorkloadClass::General,
            urgency: Urgency::Standard,
            requests: ResourceVector::new(cpu_millis, 1024, 0),
        }
    }

    fn event_names(c: &Controller) -> Vec<&'static str> {
        c.events(0, 1000)
            .unwrap()
            .iter()
            .map(|e| e.kind.name())
            .collect()
    }

    #[tokio::test]
    async fn pending_demand_is_provisioned_once() {
        let c = controller();
        c.report_pending(&[pending("a", 1500), pending("b", 1500)])
            .unwrap();

        let report = c.reconcile_once(false).await.unwrap();
        assert_eq!(report.nodes_added.len(), 1);
        assert!(report.failures.is_empty());
        let node = c.node(&report.nodes_added[0]).unwrap();
        assert_eq!(node.state, NodeState::Ready);

        // The new node's free capacity now covers the same demand.
        let again = c.reconcile_once(false).await.unwrap();
        assert!(again.actions.is_empty());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let c = controller();
        c.report_pending(&[pending("a", 3000)]).unwrap();
        let before = c.feed().last_seq().unwrap();

        let report = c.reconcile_once(true).await.unwrap();
        assert_eq!(report.actions.len(), 1);
        assert!(report.nodes_added.is_empty());
        assert_eq!(c.feed().last_seq().unwrap(), before);
        assert!(c.state().list_nodes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_running_policy() {
        let c = controller();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgrid.toml");
        std::fs::write(&path, POLICY.replace("max_size = 5", "max_size = 0\nmin_size = 2")).unwrap();

        let err = c.reload(&path).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Config(ConfigError::Parse(_) | ConfigError::Validation(_))
        ));
        assert_eq!(err.exit_code(), 1);
        assert!(event_names(&c).contains(&"policy_validation_failed"));
        assert_eq!(c.state().get_pool("general").unwrap().unwrap().max_size, 5);
    }

    #[tokio::test]
    async fn missing_policy_file_is_external_failure() {
        let c = controller();
        let err = c.reload(Path::new("/nonexistent/capgrid.toml")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn reload_cannot_orphan_active_nodes() {
        let c = controller();
        c.report_pending(&[pending("a", 1000)]).unwrap();
        c.reconcile_once(false).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgrid.toml");
        std::fs::write(&path, POLICY.replace("name = \"general\"", "name = \"batch\"")).unwrap();

        let err = c.reload(&path).unwrap_err();
        assert!(matches!(err, ControlError::Rejected(_)));
        assert!(c.state().get_pool("general").unwrap().is_some());
        assert!(c.state().get_pool("batch").unwrap().is_none());
    }

    #[tokio::test]
    async fn valid_reload_replaces_pools() {
        let c = controller();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgrid.toml");
        std::fs::write(&path, POLICY.replace("max_size = 5", "max_size = 8")).unwrap();

        let summary = c.reload(&path).unwrap();
        assert_eq!(summary.pools, 1);
        assert_eq!(summary.traffic_policies, 1);
        assert_eq!(c.state().get_pool("general").unwrap().unwrap().max_size, 8);
        let applied = event_names(&c)
            .into_iter()
            .filter(|n| *n == "policy_applied")
            .count();
        assert_eq!(applied, 2);
    }

    #[tokio::test]
    async fn manual_drain_respects_min_size_unless_forced() {
        let c = controller_with(&POLICY.replace("min_size = 0", "min_size = 1"), true);
        let report = c.reconcile_once(false).await.unwrap();
        assert_eq!(report.nodes_added.len(), 1);
        let node = report.nodes_added[0].clone();

        let err = c.manual_drain(&node, false, None).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Disruption(DisruptionError::BelowMinSize { .. })
        ));
        assert_eq!(err.exit_code(), 1);

        let started = c
            .manual_drain(&node, true, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(started, DrainStart::Started);
        assert_eq!(c.node(&node).unwrap().state, NodeState::Draining);
    }

    #[tokio::test]
    async fn mark_ready_is_idempotent() {
        let c = controller_with(POLICY, false);
        c.report_pending(&[pending("a", 1000)]).unwrap();
        let report = c.reconcile_once(false).await.unwrap();
        let node = report.nodes_added[0].clone();
        assert_eq!(c.node(&node).unwrap().state, NodeState::Provisioning);

        assert_eq!(c.mark_ready(&node).unwrap().state, NodeState::Ready);
        assert_eq!(c.mark_ready(&node).unwrap().state, NodeState::Ready);
        assert!(matches!(
            c.mark_ready("ghost").unwrap_err(),
            ControlError::NodeNotFound(_)
        ));
    }

    #[tokio::test]
    async fn status_summarizes_pools_and_policy() {
        let c = controller();
        c.report_pending(&[pending("a", 1000)]).unwrap();
        c.reconcile_once(false).await.unwrap();

        let status = c.status().await.unwrap();
        assert_eq!(status.pools.len(), 1);
        assert_eq!(status.pools[0].nodes.get("ready"), Some(&1));
        assert_eq!(status.pending_workloads, 1);
        assert_eq!(status.policy.traffic_policies, 1);
        assert!(status.last_event_seq > 0);
    }

    #[tokio::test]
    async fn traffic_resolution_uses_running_policy() {
        let c = controller();
        let effective = c.resolve("web", "api");
        assert_eq!(effective.mtls, capgrid_policy::MtlsMode::Strict);
        assert!(!effective.allowed);
        assert_eq!(c.ingress("unknown.example.com"), Ingress::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reconciles_until_shutdown() {
        let c = controller();
        c.report_pending(&[pending("a", 1000)]).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let c = c.clone();
            async move { c.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(c.state().list_nodes().unwrap().len(), 1);
    }
}
