//! Capacity provisioning collaborator.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use capgrid_state::{CapacityShape, NodeId, NodePoolSpec, NodeRecord};
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A node handed back by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedNode {
    pub id: NodeId,
    pub zone: String,
}

/// The cloud-side capacity API.
pub trait Provisioner: Send + Sync {
    fn provision<'a>(
        &'a self,
        pool: &'a NodePoolSpec,
        shape: &'a CapacityShape,
        count: u32,
    ) -> BoxFuture<'a, ProvisionResult<Vec<ProvisionedNode>>>;

    fn terminate<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, ProvisionResult<()>>;
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    failures: VecDeque<ProvisionError>,
    terminate_failures: VecDeque<ProvisionError>,
    quota: Option<u32>,
    live: u32,
    provision_calls: u32,
    terminated: Vec<NodeId>,
}

/// In-process provider for local operation and tests.
///
/// Hands out sequential node ids, spreads nodes over the shape's zones and
/// can be told to fail or stall.
#[derive(Default)]
pub struct SimulatedProvisioner {
    state: Mutex<SimState>,
    latency: Option<Duration>,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Total live nodes before `QuotaExceeded`.
    pub fn with_quota(self, quota: u32) -> Self {
        self.state.lock().expect("sim lock").quota = Some(quota);
        self
    }

    /// Queue an error for the next call to `provision`.
    pub fn fail_next(&self, error: ProvisionError) {
        self.state.lock().expect("sim lock").failures.push_back(error);
    }

    /// Queue an error for the next call to `terminate`.
    pub fn fail_next_terminate(&self, error: ProvisionError) {
        self.state
            .lock()
            .expect("sim lock")
            .terminate_failures
            .push_back(error);
    }

    pub fn provision_calls(&self) -> u32 {
        self.state.lock().expect("sim lock").provision_calls
    }

    pub fn terminated(&self) -> Vec<NodeId> {
        self.state.lock().expect("sim lock").terminated.clone()
    }
}

impl Provisioner for SimulatedProvisioner {
    fn provision<'a>(
        &'a self,
        pool: &'a NodePoolSpec,
        shape: &'a CapacityShape,
        count: u32,
    ) -> BoxFuture<'a, ProvisionResult<Vec<ProvisionedNode>>> {
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let mut sim = self.state.lock().expect("sim lock");
            sim.provision_calls += 1;
            if let Some(err) = sim.failures.pop_front() {
                return Err(err);
            }
            if let Some(quota) = sim.quota
                && sim.live + count > quota
            {
                return Err(ProvisionError::QuotaExceeded(format!(
                    "{} live + {count} requested > quota {quota}",
                    sim.live
                )));
            }

            let mut nodes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                sim.next_id += 1;
                let zone = if shape.zones.is_empty() {
                    "default".to_string()
                } else {
                    shape.zones[(sim.next_id as usize - 1) % shape.zones.len()].clone()
                };
                nodes.push(ProvisionedNode {
                    id: format!("{}-{:05}", pool.name, sim.next_id),
                    zone,
                });
            }
            sim.live += count;
            debug!(pool = %pool.name, shape = %shape.id, count, "simulated provision");
            Ok(nodes)
        })
    }

    fn terminate<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let mut sim = self.state.lock().expect("sim lock");
            if let Some(err) = sim.terminate_failures.pop_front() {
                return Err(err);
            }
            if !sim.terminated.contains(&node.id) {
                sim.terminated.push(node.id.clone());
                sim.live = sim.live.saturating_sub(1);
            }
            debug!(node = %node.id, "simulated terminate");
            Ok(())
        })
    }
}
