//! Per-node drain tasks.
//!
//! A drain owns its node from the `Draining` transition until the node is
//! terminated. Its deadline lives in a `watch` channel so an interruption
//! notice can pull it forward while the task is waiting.
//!
//! Deadlines set by an interruption are hard: the provider reclaims the
//! node then whether or not it has been terminated, so the record reaches
//! `Terminated` by the deadline even if the terminate call is slow or fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capgrid_config::{ControllerSettings, MAX_DURATION, TerminateWhen};
use capgrid_feed::EventFeed;
use capgrid_reconciler::{ProvisionError, Provisioner};
use capgrid_state::{
    DrainInfo, DrainReason, EventKind, NodeId, NodeRecord, NodeState, StateError, StateStore,
    Transition, epoch_secs,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::error::{DisruptionError, DisruptionResult};
use crate::evictor::Evictor;

/// How drains wait and terminate.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub terminate_when: TerminateWhen,
    /// How often remaining workloads are polled while waiting.
    pub poll_interval: Duration,
    /// Deadline for each provider terminate call.
    pub terminate_timeout: Duration,
    pub terminate_attempts: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            terminate_when: TerminateWhen::FirstOf,
            poll_interval: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(30),
            terminate_attempts: 3,
        }
    }
}

impl From<&ControllerSettings> for DrainConfig {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            terminate_when: settings.terminate_when,
            poll_interval: settings.drain_poll_interval,
            terminate_timeout: settings.terminate_timeout,
            terminate_attempts: 3,
        }
    }
}

/// What `Drainer::start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStart {
    Started,
    /// Another drain already owns the node.
    AlreadyDraining,
    /// The node was draining and its deadline was pulled forward.
    Tightened,
    NotDrainable(NodeState),
}

/// When a drain must be done by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrainDeadline {
    at: Instant,
    /// Set by interruptions; see the module docs.
    hard: bool,
}

struct DrainSlot {
    deadline: watch::Sender<DrainDeadline>,
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    state: StateStore,
    feed: EventFeed,
    evictor: Arc<dyn Evictor>,
    provisioner: Arc<dyn Provisioner>,
    config: DrainConfig,
    slots: Mutex<HashMap<NodeId, DrainSlot>>,
}

/// Runs drains. Cloning shares the same set of in-flight drains.
#[derive(Clone)]
pub struct Drainer {
    inner: Arc<Inner>,
}

impl Drainer {
    pub fn new(
        state: StateStore,
        feed: EventFeed,
        evictor: Arc<dyn Evictor>,
        provisioner: Arc<dyn Provisioner>,
        config: DrainConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                feed,
                evictor,
                provisioner,
                config,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Move a node into `Draining` and spawn its drain task.
    ///
    /// Voluntary drains fail with `BelowMinSize` if the pool would drop
    /// below `min_size`. Losing the CAS to another drain is a no-op, except
    /// for interruptions, which tighten the running drain to `grace`.
    pub async fn start(
        &self,
        node_id: &str,
        reason: DrainReason,
        grace: Duration,
    ) -> DisruptionResult<DrainStart> {
        self.begin(node_id, reason, grace, reason != DrainReason::Interruption)
            .await
    }

    /// Like [`Drainer::start`] without the `min_size` check.
    pub async fn start_forced(
        &self,
        node_id: &str,
        reason: DrainReason,
        grace: Duration,
    ) -> DisruptionResult<DrainStart> {
        self.begin(node_id, reason, grace, false).await
    }

    async fn begin(
        &self,
        node_id: &str,
        reason: DrainReason,
        grace: Duration,
        respect_min_size: bool,
    ) -> DisruptionResult<DrainStart> {
        let grace = grace.min(MAX_DURATION);
        // Every drain starts under this lock, so the min_size check and the
        // CAS below cannot interleave with another drain of the same pool.
        let mut slots = self.inner.slots.lock().await;
        if respect_min_size {
            check_min_size(&self.inner.state, node_id)?;
        }
        let now = epoch_secs();
        let hard = reason == DrainReason::Interruption;
        let info = DrainInfo {
            reason,
            started_at: now,
            grace_secs: grace.as_secs(),
            interrupted: hard,
        };
        let transition = self
            .inner
            .state
            .transition_node(
                node_id,
                &[NodeState::Provisioning, NodeState::Ready],
                NodeState::Draining,
                now,
                |node| node.drain = Some(info),
            )
            .map_err(|e| not_found(e, node_id))?;

        match transition {
            Transition::Applied(record) => {
                info!(node = %node_id, pool = %record.pool, %reason, grace_secs = grace.as_secs(), "drain started");
                self.inner.feed.emit(EventKind::DrainStarted {
                    node: record.id.clone(),
                    pool: record.pool.clone(),
                    reason,
                    grace_secs: grace.as_secs(),
                })?;
                let deadline = DrainDeadline {
                    at: Instant::now() + grace,
                    hard,
                };
                self.spawn(&mut slots, record, deadline);
                Ok(DrainStart::Started)
            }
            Transition::Conflict {
                actual: NodeState::Draining,
            } if reason == DrainReason::Interruption => {
                self.tighten_locked(&mut slots, node_id, grace)?;
                Ok(DrainStart::Tightened)
            }
            Transition::Conflict {
                actual: NodeState::Draining,
            } => {
                debug!(node = %node_id, %reason, "node already draining");
                Ok(DrainStart::AlreadyDraining)
            }
            Transition::Conflict { actual } => Ok(DrainStart::NotDrainable(actual)),
        }
    }

    /// Pull a running drain's deadline to at most `grace` from now.
    /// Returns false when the existing deadline was already earlier.
    pub async fn tighten(&self, node_id: &str, grace: Duration) -> DisruptionResult<bool> {
        let mut slots = self.inner.slots.lock().await;
        self.tighten_locked(&mut slots, node_id, grace)
    }

    fn tighten_locked(
        &self,
        slots: &mut HashMap<NodeId, DrainSlot>,
        node_id: &str,
        grace: Duration,
    ) -> DisruptionResult<bool> {
        let grace = grace.min(MAX_DURATION);
        let target = Instant::now() + grace;

        if let Some(slot) = slots.get(node_id)
            && !*slot.done.borrow()
        {
            let mut tightened = false;
            slot.deadline.send_if_modified(|deadline| {
                let was_hard = deadline.hard;
                deadline.hard = true;
                if target < deadline.at {
                    deadline.at = target;
                    tightened = true;
                }
                tightened || !was_hard
            });
            if !tightened {
                debug!(node = %node_id, "existing drain deadline is already earlier");
                self.persist_grace(node_id, grace)?;
                return Ok(false);
            }
            self.persist_grace(node_id, grace)?;
        } else {
            // Draining in the store but no task here: adopt it.
            let record = self
                .inner
                .state
                .get_node(node_id)?
                .ok_or_else(|| DisruptionError::NodeNotFound(node_id.to_string()))?;
            if record.state != NodeState::Draining {
                return Ok(false);
            }
            let record = self.persist_grace(node_id, grace)?.unwrap_or(record);
            self.spawn(
                slots,
                record,
                DrainDeadline {
                    at: target,
                    hard: true,
                },
            );
        }

        info!(node = %node_id, deadline_secs = grace.as_secs(), "drain deadline tightened");
        self.inner.feed.emit(EventKind::DrainTightened {
            node: node_id.to_string(),
            deadline_secs: grace.as_secs(),
        })?;
        Ok(true)
    }

    /// Record the interruption deadline so a restarted controller honours it.
    fn persist_grace(
        &self,
        node_id: &str,
        grace: Duration,
    ) -> DisruptionResult<Option<NodeRecord>> {
        let now = epoch_secs();
        let transition = self.inner.state.transition_node(
            node_id,
            &[NodeState::Draining],
            NodeState::Draining,
            now,
            |node| {
                if let Some(drain) = node.drain.as_mut() {
                    let elapsed = now.saturating_sub(drain.started_at);
                    drain.grace_secs = drain.grace_secs.min(elapsed + grace.as_secs());
                    drain.interrupted = true;
                }
            },
        )?;
        Ok(match transition {
            Transition::Applied(record) => Some(record),
            Transition::Conflict { .. } => None,
        })
    }

    /// Wait until the node's drain task has finished.
    pub async fn wait(&self, node_id: &str) {
        let done = {
            let slots = self.inner.slots.lock().await;
            slots.get(node_id).map(|slot| slot.done.clone())
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Spawn drain tasks for `Draining` nodes that have none, e.g. after a
    /// controller restart. Returns the adopted node ids.
    pub async fn resume_orphans(&self) -> DisruptionResult<Vec<NodeId>> {
        let mut slots = self.inner.slots.lock().await;
        let now = epoch_secs();
        let mut adopted = Vec::new();
        for node in self.inner.state.list_nodes()? {
            if node.state != NodeState::Draining || slots.contains_key(&node.id) {
                continue;
            }
            let left = node
                .drain
                .as_ref()
                .map(|d| d.started_at.saturating_add(d.grace_secs).saturating_sub(now))
                .unwrap_or(0)
                .min(MAX_DURATION.as_secs());
            let hard = node
                .drain
                .as_ref()
                .is_some_and(|d| d.interrupted || d.reason == DrainReason::Interruption);
            info!(node = %node.id, remaining_secs = left, hard, "resuming orphaned drain");
            adopted.push(node.id.clone());
            let deadline = DrainDeadline {
                at: Instant::now() + Duration::from_secs(left),
                hard,
            };
            self.spawn(&mut slots, node, deadline);
        }
        Ok(adopted)
    }

    /// Node ids with a drain task in flight.
    pub async fn active(&self) -> Vec<NodeId> {
        let slots = self.inner.slots.lock().await;
        let mut ids: Vec<NodeId> = slots
            .iter()
            .filter(|(_, slot)| !*slot.done.borrow())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Abort every drain task. Nodes stay `Draining` and are resumed on
    /// the next start.
    pub async fn stop_all(&self) {
        let mut slots = self.inner.slots.lock().await;
        for (id, slot) in slots.drain() {
            debug!(node = %id, "aborting drain task");
            slot.handle.abort();
        }
    }

    fn spawn(
        &self,
        slots: &mut HashMap<NodeId, DrainSlot>,
        node: NodeRecord,
        deadline: DrainDeadline,
    ) {
        let (deadline_tx, deadline_rx) = watch::channel(deadline);
        let (done_tx, done_rx) = watch::channel(false);
        let id = node.id.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_drain(inner, node, deadline_rx, done_tx));
        slots.insert(
            id,
            DrainSlot {
                deadline: deadline_tx,
                done: done_rx,
                handle,
            },
        );
    }
}

/// Refuse to drain the node if its pool would drop below `min_size`.
fn check_min_size(state: &StateStore, node_id: &str) -> DisruptionResult<()> {
    let node = state
        .get_node(node_id)?
        .ok_or_else(|| DisruptionError::NodeNotFound(node_id.to_string()))?;
    if !node.state.accepts_workloads() {
        return Ok(());
    }
    let Some(pool) = state.get_pool(&node.pool)? else {
        return Ok(());
    };
    let serving = state
        .list_nodes_for_pool(&pool.name)?
        .iter()
        .filter(|n| n.state.accepts_workloads())
        .count() as u32;
    if serving.saturating_sub(1) < pool.min_size {
        return Err(DisruptionError::BelowMinSize {
            node: node.id,
            pool: pool.name,
            min_size: pool.min_size,
        });
    }
    Ok(())
}

fn not_found(err: StateError, node_id: &str) -> DisruptionError {
    match err {
        StateError::NotFound(_) => DisruptionError::NodeNotFound(node_id.to_string()),
        other => DisruptionError::State(other),
    }
}

async fn run_drain(
    inner: Arc<Inner>,
    node: NodeRecord,
    mut deadline_rx: watch::Receiver<DrainDeadline>,
    done_tx: watch::Sender<bool>,
) {
    let node_id = node.id.clone();

    if let Err(e) = inner.evictor.cordon(&node).await {
        warn!(node = %node_id, error = %e, "cordon failed");
    }
    let grace = deadline_rx
        .borrow()
        .at
        .saturating_duration_since(Instant::now());
    if let Err(e) = inner.evictor.evict(&node, grace).await {
        warn!(node = %node_id, error = %e, "eviction request failed");
    }

    let forced = loop {
        let deadline = deadline_rx.borrow_and_update().at;
        let remaining = match inner.evictor.remaining(&node_id).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(node = %node_id, error = %e, "could not read remaining workloads");
                None
            }
        };
        if inner.config.terminate_when == TerminateWhen::FirstOf && remaining == Some(0) {
            break false;
        }
        let now = Instant::now();
        if now >= deadline {
            break remaining != Some(0);
        }

        let wake = deadline.min(now + inner.config.poll_interval);
        tokio::select! {
            _ = sleep_until(wake) => {}
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    sleep_until(wake).await;
                    continue;
                }
                let grace = deadline_rx.borrow().at.saturating_duration_since(Instant::now());
                if let Err(e) = inner.evictor.evict(&node, grace).await {
                    warn!(node = %node_id, error = %e, "eviction request failed");
                }
            }
        }
    };

    let deadline = *deadline_rx.borrow();
    if deadline.hard {
        terminate_by(&inner, &node, deadline.at, forced).await;
    } else {
        match terminate(inner.clone(), node.clone()).await {
            Ok(()) => finish(&inner, &node, forced, None),
            Err(e) => error!(
                node = %node_id,
                error = %e,
                "terminate failed; node stays draining until the next resume"
            ),
        }
    }

    let mut slots = inner.slots.lock().await;
    let _ = done_tx.send(true);
    slots.remove(&node_id);
}

/// Terminate a node whose deadline is set by the provider. The record is
/// `Terminated` no later than `deadline`; a provider call still running
/// then is left to finish in the background.
async fn terminate_by(inner: &Arc<Inner>, node: &NodeRecord, deadline: Instant, forced: bool) {
    let mut call = Box::pin(terminate(inner.clone(), node.clone()));
    match timeout_at(deadline, &mut call).await {
        Ok(Ok(())) => finish(inner, node, forced, None),
        Ok(Err(e)) => {
            warn!(
                node = %node.id,
                error = %e,
                "terminate failed; recording termination at the interruption deadline"
            );
            sleep_until(deadline).await;
            finish(inner, node, true, Some(e.to_string()));
        }
        Err(_) => {
            warn!(node = %node.id, "terminate still running at the interruption deadline");
            finish(
                inner,
                node,
                true,
                Some("terminate still running at the interruption deadline".to_string()),
            );
            let node_id = node.id.clone();
            tokio::spawn(async move {
                match call.await {
                    Ok(()) => debug!(node = %node_id, "late terminate confirmed"),
                    Err(e) => warn!(node = %node_id, error = %e, "late terminate failed"),
                }
            });
        }
    }
}

async fn terminate(inner: Arc<Inner>, node: NodeRecord) -> DisruptionResult<()> {
    let attempts = inner.config.terminate_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match timeout(
            inner.config.terminate_timeout,
            inner.provisioner.terminate(&node),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::TimedOut(inner.config.terminate_timeout)),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts && (e.is_retryable() || e.is_timeout()) => {
                warn!(node = %node.id, attempt, error = %e, "terminate failed, retrying");
                sleep(Duration::from_millis(500) * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn finish(inner: &Inner, node: &NodeRecord, forced: bool, error: Option<String>) {
    let transition = inner.state.transition_node(
        &node.id,
        &[NodeState::Draining],
        NodeState::Terminated,
        epoch_secs(),
        |record| record.workloads.clear(),
    );
    match transition {
        Ok(Transition::Applied(_)) => {
            info!(node = %node.id, pool = %node.pool, forced, "node terminated");
            if let Err(e) = inner.feed.emit(EventKind::NodeTerminated {
                node: node.id.clone(),
                pool: node.pool.clone(),
                forced,
                error,
            }) {
                error!(node = %node.id, error = %e, "failed to emit termination event");
            }
        }
        Ok(Transition::Conflict { actual }) => {
            debug!(node = %node.id, %actual, "node left draining before termination");
        }
        Err(e) => error!(node = %node.id, error = %e, "failed to record termination"),
    }
}
