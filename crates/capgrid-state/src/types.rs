//! Domain types for the capgrid state store.
//!
//! These types describe purchasable capacity, node pools, provisioned
//! nodes, pending workloads and the observability event log. All types
//! are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a capacity shape in the catalog.
pub type ShapeId = String;

/// Name of a node pool.
pub type PoolName = String;

/// Unique identifier for a provisioned node.
pub type NodeId = String;

/// Identifier of a workload reported by the cluster scheduler.
pub type WorkloadId = String;

// ── Resources ─────────────────────────────────────────────────────

/// A bundle of schedulable resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub gpus: u32,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu_millis: 0,
        memory_mib: 0,
        gpus: 0,
    };

    pub fn new(cpu_millis: u64, memory_mib: u64, gpus: u32) -> Self {
        Self {
            cpu_millis,
            memory_mib,
            gpus,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mib: self.memory_mib.saturating_sub(other.memory_mib),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }

    /// Component-wise maximum.
    pub fn max(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_mib: self.memory_mib.max(other.memory_mib),
            gpus: self.gpus.max(other.gpus),
        }
    }

    /// Whether every component of `self` fits inside `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        self.cpu_millis <= capacity.cpu_millis
            && self.memory_mib <= capacity.memory_mib
            && self.gpus <= capacity.gpus
    }

    /// Multiply every component by `n`.
    pub fn times(&self, n: u32) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_mul(u64::from(n)),
            memory_mib: self.memory_mib.saturating_mul(u64::from(n)),
            gpus: self.gpus.saturating_mul(n),
        }
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_add(rhs.cpu_millis),
            memory_mib: self.memory_mib.saturating_add(rhs.memory_mib),
            gpus: self.gpus.saturating_add(rhs.gpus),
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        *self = *self + rhs;
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}Mi gpu={}",
            self.cpu_millis, self.memory_mib, self.gpus
        )
    }
}

// ── Capacity shapes ───────────────────────────────────────────────

/// How a shape is purchased from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurchaseMode {
    Spot,
    OnDemand,
}

impl fmt::Display for PurchaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseMode::Spot => f.write_str("spot"),
            PurchaseMode::OnDemand => f.write_str("on-demand"),
        }
    }
}

/// Immutable description of a purchasable compute shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityShape {
    pub id: ShapeId,
    pub cpu_millis: u64,
    pub memory_mib: u64,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub gpu_type: Option<String>,
    pub purchase: PurchaseMode,
    pub zones: Vec<String>,
    /// Hourly cost hint in the provider's currency.
    pub hourly_cost: f64,
}

impl CapacityShape {
    /// Allocatable resources of one node of this shape.
    pub fn capacity(&self) -> ResourceVector {
        ResourceVector::new(self.cpu_millis, self.memory_mib, self.gpus)
    }
}

// ── Taints & tolerations ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    /// Whether an untolerated taint with this effect keeps workloads away.
    pub fn is_hard(&self) -> bool {
        !matches!(self, TaintEffect::PreferNoSchedule)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// A toleration carried by a workload class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    /// `None` with `Exists` tolerates every taint.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: Option<String>,
    /// `None` matches every effect.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Exact Kubernetes toleration semantics.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(key), _) if *key != taint.key => false,
            (Some(_), TolerationOperator::Exists) => true,
            (Some(_), TolerationOperator::Equal) => self.value == taint.value,
        }
    }
}

// ── Workload classification ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadClass {
    General,
    GpuTraining,
    GpuInference,
}

impl WorkloadClass {
    pub const ALL: [WorkloadClass; 3] = [
        WorkloadClass::General,
        WorkloadClass::GpuTraining,
        WorkloadClass::GpuInference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::General => "general",
            WorkloadClass::GpuTraining => "gpu-training",
            WorkloadClass::GpuInference => "gpu-inference",
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown workload class: {s}"))
    }
}

/// Urgency of pending demand. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
    BestEffort,
    #[default]
    Standard,
    LatencyCritical,
}

impl Urgency {
    /// Purchase mode the reconciler tries first for this urgency.
    pub fn preferred_purchase(&self) -> PurchaseMode {
        match self {
            Urgency::BestEffort | Urgency::Standard => PurchaseMode::Spot,
            Urgency::LatencyCritical => PurchaseMode::OnDemand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::BestEffort => "best-effort",
            Urgency::Standard => "standard",
            Urgency::LatencyCritical => "latency-critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Node pools ────────────────────────────────────────────────────

/// When the consolidation planner may remove a pool's nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleDownPolicy {
    #[serde(alias = "WhenEmpty")]
    WhenEmpty,
    #[serde(alias = "WhenUnderutilized")]
    WhenUnderutilized,
}

/// Operator-defined node pool. Only mutated by an explicit policy reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    pub name: PoolName,
    /// Eligible capacity shape ids.
    pub shapes: Vec<ShapeId>,
    pub min_size: u32,
    pub max_size: u32,
    /// Higher weight pools are filled first when several accept a class.
    #[serde(default)]
    pub weight: i32,
    pub scale_down: ScaleDownPolicy,
    /// Utilization fraction below which a node counts as underutilized.
    pub utilization_threshold: f64,
    /// How long a node must stay empty/underutilized before it is drained.
    pub consolidate_after_secs: u64,
    /// Grace period given to workloads on voluntary drains.
    pub disruption_grace_secs: u64,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodePoolSpec {
    pub fn is_eligible(&self, shape: &str) -> bool {
        self.shapes.iter().any(|s| s == shape)
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Node lifecycle: `Provisioning → Ready → Draining → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

impl NodeState {
    /// Counts against the pool's size bounds.
    pub fn is_active(&self) -> bool {
        !matches!(self, NodeState::Terminated)
    }

    pub fn accepts_workloads(&self) -> bool {
        matches!(self, NodeState::Provisioning | NodeState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Provisioning => "provisioning",
            NodeState::Ready => "ready",
            NodeState::Draining => "draining",
            NodeState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload currently bound to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedWorkload {
    pub id: WorkloadId,
    #[serde(default)]
    pub requests: ResourceVector,
    /// Daemon-style workloads that do not keep a node alive.
    #[serde(default)]
    pub system: bool,
    /// Whether the workload may be evicted for consolidation.
    #[serde(default = "default_true")]
    pub migratable: bool,
}

fn default_true() -> bool {
    true
}

/// Latest utilization report for a node (fractions 0.0–1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub cpu: f64,
    pub memory: f64,
    pub sampled_at: u64,
}

impl UtilizationSample {
    /// The dominant dimension decides whether a node is underutilized.
    pub fn peak(&self) -> f64 {
        self.cpu.max(self.memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    Consolidation,
    Interruption,
    Manual,
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::Consolidation => f.write_str("consolidation"),
            DrainReason::Interruption => f.write_str("interruption"),
            DrainReason::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainInfo {
    pub reason: DrainReason,
    pub started_at: u64,
    pub grace_secs: u64,
    /// An interruption notice set the deadline; it cannot be overrun.
    #[serde(default)]
    pub interrupted: bool,
}

/// A provisioned unit of capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub pool: PoolName,
    pub shape: ShapeId,
    pub zone: String,
    pub state: NodeState,
    #[serde(default)]
    pub workloads: Vec<AssignedWorkload>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub utilization: Option<UtilizationSample>,
    /// Since when the node hosts no non-system workloads.
    #[serde(default)]
    pub empty_since: Option<u64>,
    /// Since when the latest samples have stayed under the pool threshold.
    #[serde(default)]
    pub underutilized_since: Option<u64>,
    #[serde(default)]
    pub drain: Option<DrainInfo>,
}

impl NodeRecord {
    /// Fresh record for a node that was just requested from the provider.
    pub fn provisioning(id: &str, pool: &str, shape: &str, zone: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            pool: pool.to_string(),
            shape: shape.to_string(),
            zone: zone.to_string(),
            state: NodeState::Provisioning,
            workloads: Vec::new(),
            created_at: now,
            updated_at: now,
            utilization: None,
            empty_since: Some(now),
            underutilized_since: None,
            drain: None,
        }
    }

    /// Sum of resource requests of all bound workloads.
    pub fn allocated(&self) -> ResourceVector {
        self.workloads
            .iter()
            .fold(ResourceVector::ZERO, |acc, w| acc + w.requests)
    }

    pub fn non_system_workloads(&self) -> usize {
        self.workloads.iter().filter(|w| !w.system).count()
    }

    /// True when every non-system workload may be moved elsewhere.
    pub fn all_migratable(&self) -> bool {
        self.workloads.iter().all(|w| w.system || w.migratable)
    }
}

// ── Pending workloads ─────────────────────────────────────────────

/// An unschedulable workload reported by the cluster scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWorkload {
    pub id: WorkloadId,
    pub namespace: String,
    pub class: WorkloadClass,
    #[serde(default)]
    pub urgency: Urgency,
    pub requests: ResourceVector,
}

// ── Events ────────────────────────────────────────────────────────

/// Why a scale-up could not cover pending demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallReason {
    /// Every matching pool is at `max_size`.
    PoolAtMax,
    /// No pool tolerates the workload class.
    NoMatchingPool,
    /// Matching pools exist but none has a shape that fits the per-unit ask.
    NoEligibleShape,
}

impl fmt::Display for ShortfallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortfallReason::PoolAtMax => f.write_str("pool at max size"),
            ShortfallReason::NoMatchingPool => f.write_str("no pool accepts workload class"),
            ShortfallReason::NoEligibleShape => f.write_str("no eligible shape fits workload"),
        }
    }
}

/// A state transition published on the observability feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// `class`/`urgency` are absent when the pool is topped up to `min_size`.
    ScaleUpPlanned {
        pool: PoolName,
        shape: ShapeId,
        count: u32,
        class: Option<WorkloadClass>,
        urgency: Option<Urgency>,
    },
    ScaleUpApplied {
        pool: PoolName,
        shape: ShapeId,
        nodes: Vec<NodeId>,
        attempts: u32,
    },
    ScaleUpFailed {
        pool: PoolName,
        shape: ShapeId,
        count: u32,
        reason: String,
        timed_out: bool,
    },
    CapacityShortfall {
        class: WorkloadClass,
        urgency: Urgency,
        pool: Option<PoolName>,
        missing_nodes: u32,
        unmet: ResourceVector,
        reason: ShortfallReason,
    },
    DrainStarted {
        node: NodeId,
        pool: PoolName,
        reason: DrainReason,
        grace_secs: u64,
    },
    DrainTightened {
        node: NodeId,
        deadline_secs: u64,
    },
    NodeTerminated {
        node: NodeId,
        pool: PoolName,
        forced: bool,
        /// Why the provider did not confirm termination, if it did not.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InterruptionReceived {
        node: NodeId,
        deadline_secs: u64,
    },
    PolicyValidationFailed {
        source: String,
        errors: Vec<String>,
    },
    PolicyApplied {
        pools: usize,
        traffic_policies: usize,
    },
}

impl EventKind {
    /// Stable name used for counters and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ScaleUpPlanned { .. } => "scale_up_planned",
            EventKind::ScaleUpApplied { .. } => "scale_up_applied",
            EventKind::ScaleUpFailed { .. } => "scale_up_failed",
            EventKind::CapacityShortfall { .. } => "capacity_shortfall",
            EventKind::DrainStarted { .. } => "drain_started",
            EventKind::DrainTightened { .. } => "drain_tightened",
            EventKind::NodeTerminated { .. } => "node_terminated",
            EventKind::InterruptionReceived { .. } => "interruption_received",
            EventKind::PolicyValidationFailed { .. } => "policy_validation_failed",
            EventKind::PolicyApplied { .. } => "policy_applied",
        }
    }
}

/// A sequenced entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    /// Unix timestamp (seconds).
    pub at: u64,
    pub kind: EventKind,
}

/// Result of a compare-and-swap lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The node was in an expected state and now holds the new one.
    Applied(NodeRecord),
    /// Another writer moved the node first.
    Conflict { actual: NodeState },
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: Option<&str>, effect: TaintEffect) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.map(str::to_string),
            effect,
        }
    }

    #[test]
    fn toleration_equal_requires_matching_value() {
        let t = taint("nvidia.com/gpu", Some("true"), TaintEffect::NoSchedule);
        let tol = Toleration {
            key: Some("nvidia.com/gpu".to_string()),
            operator: TolerationOperator::Equal,
            value: Some("true".to_string()),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(tol.tolerates(&t));

        let wrong_value = Toleration {
            value: Some("false".to_string()),
            ..tol.clone()
        };
        assert!(!wrong_value.tolerates(&t));
    }

    #[test]
    fn toleration_exists_ignores_value() {
        let t = taint("dedicated", Some("training"), TaintEffect::NoExecute);
        let tol = Toleration {
            key: Some("dedicated".to_string()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        };
        assert!(tol.tolerates(&t));
    }

    #[test]
    fn toleration_effect_must_match_when_set() {
        let t = taint("dedicated", None, TaintEffect::NoExecute);
        let tol = Toleration {
            key: Some("dedicated".to_string()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(!tol.tolerates(&t));
    }

    #[test]
    fn wildcard_toleration() {
        let tol = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        };
        assert!(tol.tolerates(&taint("anything", Some("x"), TaintEffect::NoSchedule)));
    }

    #[test]
    fn resource_vector_arithmetic() {
        let a = ResourceVector::new(4000, 8192, 1);
        let b = ResourceVector::new(1000, 10_000, 0);
        assert_eq!(a.saturating_sub(&b), ResourceVector::new(3000, 0, 1));
        assert_eq!(a + b, ResourceVector::new(5000, 18_192, 1));
        assert!(b.saturating_sub(&a).fits_within(&a));
        assert_eq!(b.times(3).cpu_millis, 3000);
    }

    #[test]
    fn urgency_prefers_spot_except_latency_critical() {
        assert_eq!(Urgency::BestEffort.preferred_purchase(), PurchaseMode::Spot);
        assert_eq!(Urgency::Standard.preferred_purchase(), PurchaseMode::Spot);
        assert_eq!(
            Urgency::LatencyCritical.preferred_purchase(),
            PurchaseMode::OnDemand
        );
    }

    #[test]
    fn workload_class_parses_kebab_case() {
        assert_eq!("gpu-training".parse::<WorkloadClass>(), Ok(WorkloadClass::GpuTraining));
        assert!("cpu".parse::<WorkloadClass>().is_err());
    }

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let kind = EventKind::NodeTerminated {
            node: "n1".to_string(),
            pool: "general".to_string(),
            forced: true,
            error: None,
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"type\":\"node_terminated\""));
    }
}
