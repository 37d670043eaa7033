//! Scale-up planning.
//!
//! `reconcile` is a pure function of demand, pools, nodes, the capacity
//! catalog and class tolerations. It never proposes removing capacity;
//! scale-down belongs to the consolidation planner.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use capgrid_config::{CapacityCatalog, ClassTolerations};
use capgrid_demand::DemandVector;
use capgrid_state::{
    CapacityShape, EventKind, NodePoolSpec, NodeRecord, NodeState, PoolName, PurchaseMode,
    ResourceVector, ShapeId, ShortfallReason, Urgency, WorkloadClass,
};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp {
        pool: PoolName,
        shape: ShapeId,
        count: u32,
        /// `None` when topping a pool up to `min_size`.
        class: Option<WorkloadClass>,
        urgency: Option<Urgency>,
    },
    Shortfall {
        class: WorkloadClass,
        urgency: Urgency,
        pool: Option<PoolName>,
        missing_nodes: u32,
        unmet: ResourceVector,
        reason: ShortfallReason,
    },
}

impl ScaleAction {
    /// The event announcing this action.
    pub fn to_event(&self) -> EventKind {
        match self.clone() {
            ScaleAction::ScaleUp {
                pool,
                shape,
                count,
                class,
                urgency,
            } => EventKind::ScaleUpPlanned {
                pool,
                shape,
                count,
                class,
                urgency,
            },
            ScaleAction::Shortfall {
                class,
                urgency,
                pool,
                missing_nodes,
                unmet,
                reason,
            } => EventKind::CapacityShortfall {
                class,
                urgency,
                pool,
                missing_nodes,
                unmet,
                reason,
            },
        }
    }
}

/// Nodes of `capacity` needed to cover `need`, taking the ceiling per
/// dimension. `None` if a requested dimension is absent from the shape.
pub fn nodes_needed(need: &ResourceVector, capacity: &ResourceVector) -> Option<u32> {
    fn dim(need: u64, cap: u64) -> Option<u64> {
        match (need, cap) {
            (0, _) => Some(0),
            (_, 0) => None,
            (n, c) => Some(n.div_ceil(c)),
        }
    }
    let n = dim(need.cpu_millis, capacity.cpu_millis)?
        .max(dim(need.memory_mib, capacity.memory_mib)?)
        .max(dim(u64::from(need.gpus), u64::from(capacity.gpus))?);
    Some(u32::try_from(n).unwrap_or(u32::MAX))
}

/// Working view of one pool during a reconcile pass.
#[derive(Debug, Clone, Default)]
struct PoolLedger {
    /// Unclaimed capacity per Ready or in-flight Provisioning node,
    /// including nodes planned in this pass.
    free: Vec<ResourceVector>,
    /// Non-terminated nodes, including ones planned in this pass.
    active: u32,
}

impl PoolLedger {
    /// Claim up to `need` from nodes that can each host a `per_unit` ask.
    /// Returns what is still unmet.
    fn claim(&mut self, need: ResourceVector, per_unit: &ResourceVector) -> ResourceVector {
        let mut need = need;
        for slot in &mut self.free {
            if need.is_zero() {
                break;
            }
            if !per_unit.fits_within(slot) {
                continue;
            }
            let taken = clamp(&need, slot);
            *slot = slot.saturating_sub(&taken);
            need = need.saturating_sub(&taken);
        }
        need
    }

    /// Record `count` planned nodes of `capacity`, filling them with `need`.
    fn plan_nodes(
        &mut self,
        count: u32,
        capacity: ResourceVector,
        need: ResourceVector,
    ) -> ResourceVector {
        let mut need = need;
        for _ in 0..count {
            let taken = clamp(&need, &capacity);
            need = need.saturating_sub(&taken);
            self.free.push(capacity.saturating_sub(&taken));
        }
        self.active += count;
        need
    }
}

/// Per-dimension minimum of `need` and `limit`.
fn clamp(need: &ResourceVector, limit: &ResourceVector) -> ResourceVector {
    need.saturating_sub(&need.saturating_sub(limit))
}

pub struct Reconciler<'a> {
    catalog: &'a CapacityCatalog,
    classes: &'a ClassTolerations,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a CapacityCatalog, classes: &'a ClassTolerations) -> Self {
        Self { catalog, classes }
    }

    /// Cheapest shape of `pool` that fits `per_unit`, measured by the total
    /// hourly cost of covering `need`. The urgency's preferred purchase mode
    /// is tried first; the other mode only when nothing preferred fits.
    pub fn select_shape(
        &self,
        pool: &NodePoolSpec,
        urgency: Urgency,
        per_unit: &ResourceVector,
        need: &ResourceVector,
    ) -> Option<(&'a CapacityShape, u32)> {
        let preferred = urgency.preferred_purchase();
        let fallback = match preferred {
            PurchaseMode::Spot => PurchaseMode::OnDemand,
            PurchaseMode::OnDemand => PurchaseMode::Spot,
        };
        [preferred, fallback].into_iter().find_map(|mode| {
            self.catalog
                .shapes_for_mode(pool, mode)
                .filter(|shape| per_unit.fits_within(&shape.capacity()))
                .filter_map(|shape| {
                    nodes_needed(need, &shape.capacity()).map(|n| (shape, n.max(1)))
                })
                .min_by(|(a, na), (b, nb)| {
                    let cost_a = a.hourly_cost * f64::from(*na);
                    let cost_b = b.hourly_cost * f64::from(*nb);
                    cost_a
                        .total_cmp(&cost_b)
                        .then_with(|| a.id.cmp(&b.id))
                })
        })
    }

    /// Compute the scale-up actions that cover `demand`.
    pub fn reconcile(
        &self,
        demand: &[DemandVector],
        pools: &[NodePoolSpec],
        nodes: &[NodeRecord],
    ) -> Vec<ScaleAction> {
        let mut ledgers = self.ledgers(pools, nodes);
        let mut actions = Vec::new();

        let mut buckets: Vec<&DemandVector> = demand.iter().collect();
        buckets.sort_by_key(|d| (Reverse(d.urgency), d.class));

        for bucket in buckets {
            let mut matching: Vec<&NodePoolSpec> = pools
                .iter()
                .filter(|p| self.classes.accepts(bucket.class, p))
                .collect();
            matching.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

            if matching.is_empty() {
                actions.push(ScaleAction::Shortfall {
                    class: bucket.class,
                    urgency: bucket.urgency,
                    pool: None,
                    missing_nodes: bucket.workloads,
                    unmet: bucket.total,
                    reason: ShortfallReason::NoMatchingPool,
                });
                continue;
            }

            // Existing and in-flight capacity first. Only nodes with room
            // for the largest single ask count.
            let mut remaining = bucket.total;
            for pool in matching.iter().copied() {
                if let Some(ledger) = ledgers.get_mut(pool.name.as_str()) {
                    remaining = ledger.claim(remaining, &bucket.per_unit);
                }
            }
            if remaining.is_zero() {
                continue;
            }

            let mut blocked_at: Option<(&NodePoolSpec, &CapacityShape)> = None;
            for pool in matching.iter().copied() {
                let Some((shape, needed)) =
                    self.select_shape(pool, bucket.urgency, &bucket.per_unit, &remaining)
                else {
                    continue;
                };
                let Some(ledger) = ledgers.get_mut(pool.name.as_str()) else {
                    continue;
                };
                let headroom = pool.max_size.saturating_sub(ledger.active);
                if headroom == 0 {
                    blocked_at = Some((pool, shape));
                    continue;
                }

                let count = needed.min(headroom);
                remaining = ledger.plan_nodes(count, shape.capacity(), remaining);
                actions.push(ScaleAction::ScaleUp {
                    pool: pool.name.clone(),
                    shape: shape.id.clone(),
                    count,
                    class: Some(bucket.class),
                    urgency: Some(bucket.urgency),
                });
                if remaining.is_zero() {
                    break;
                }
                blocked_at = Some((pool, shape));
            }

            if !remaining.is_zero() {
                let action = match blocked_at {
                    Some((pool, shape)) => ScaleAction::Shortfall {
                        class: bucket.class,
                        urgency: bucket.urgency,
                        pool: Some(pool.name.clone()),
                        missing_nodes: nodes_needed(&remaining, &shape.capacity()).unwrap_or(0),
                        unmet: remaining,
                        reason: ShortfallReason::PoolAtMax,
                    },
                    None => ScaleAction::Shortfall {
                        class: bucket.class,
                        urgency: bucket.urgency,
                        pool: None,
                        missing_nodes: bucket.workloads,
                        unmet: remaining,
                        reason: ShortfallReason::NoEligibleShape,
                    },
                };
                actions.push(action);
            }
        }

        actions.extend(self.min_size_floor(pools, &ledgers));

        debug!(
            buckets = demand.len(),
            actions = actions.len(),
            "reconcile computed"
        );
        actions
    }

    fn ledgers<'p>(
        &self,
        pools: &'p [NodePoolSpec],
        nodes: &[NodeRecord],
    ) -> BTreeMap<&'p str, PoolLedger> {
        let mut ledgers: BTreeMap<&'p str, PoolLedger> = pools
            .iter()
            .map(|p| (p.name.as_str(), PoolLedger::default()))
            .collect();

        for node in nodes {
            let Some(ledger) = ledgers.get_mut(node.pool.as_str()) else {
                continue;
            };
            if node.state.is_active() {
                ledger.active += 1;
            }
            if matches!(node.state, NodeState::Ready | NodeState::Provisioning)
                && let Some(shape) = self.catalog.get(&node.shape)
            {
                ledger.free.push(shape.capacity().saturating_sub(&node.allocated()));
            }
        }
        ledgers
    }

    /// Bring pools below `min_size` back up with their cheapest shape.
    fn min_size_floor(
        &self,
        pools: &[NodePoolSpec],
        ledgers: &BTreeMap<&str, PoolLedger>,
    ) -> Vec<ScaleAction> {
        let mut actions = Vec::new();
        for pool in pools {
            let active = ledgers.get(pool.name.as_str()).map_or(0, |l| l.active);
            if active >= pool.min_size {
                continue;
            }
            let shape = self
                .select_shape(pool, Urgency::Standard, &ResourceVector::ZERO, &ResourceVector::ZERO)
                .map(|(shape, _)| shape);
            if let Some(shape) = shape {
                actions.push(ScaleAction::ScaleUp {
                    pool: pool.name.clone(),
                    shape: shape.id.clone(),
                    count: pool.min_size - active,
                    class: None,
                    urgency: None,
                });
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_config::WORKLOAD_CLASS_LABEL;
    use capgrid_state::{
        AssignedWorkload, ScaleDownPolicy, Taint, TaintEffect, Toleration, TolerationOperator,
    };

    fn shape(id: &str, cpu: u64, mem: u64, gpus: u32, purchase: PurchaseMode, cost: f64) -> CapacityShape {
        CapacityShape {
            id: id.to_string(),
            cpu_millis: cpu,
            memory_mib: mem,
            gpus,
            gpu_type: (gpus > 0).then(|| "a10g".to_string()),
            purchase,
            zones: vec!["zone-a".to_string()],
            hourly_cost: cost,
        }
    }

    fn catalog() -> CapacityCatalog {
        CapacityCatalog::new([
            shape("m.large", 4000, 16_384, 0, PurchaseMode::OnDemand, 0.20),
            shape("m.large.spot", 4000, 16_384, 0, PurchaseMode::Spot, 0.06),
            shape("m.xlarge.spot", 8000, 32_768, 0, PurchaseMode::Spot, 0.14),
            shape("g.xlarge", 8000, 65_536, 1, PurchaseMode::OnDemand, 1.20),
        ])
    }

    fn pool(name: &str, shapes: &[&str], min: u32, max: u32) -> NodePoolSpec {
        NodePoolSpec {
            name: name.to_string(),
            shapes: shapes.iter().map(|s| s.to_string()).collect(),
            min_size: min,
            max_size: max,
            weight: 0,
            scale_down: ScaleDownPolicy::WhenUnderutilized,
            utilization_threshold: 0.5,
            consolidate_after_secs: 600,
            disruption_grace_secs: 300,
            taints: Vec::new(),
            labels: Default::default(),
        }
    }

    fn gpu_pool(max: u32) -> NodePoolSpec {
        let mut p = pool("gpu", &["g.xlarge"], 0, max);
        p.taints = vec![Taint {
            key: "nvidia.com/gpu".to_string(),
            value: None,
            effect: TaintEffect::NoSchedule,
        }];
        p.labels
            .insert(WORKLOAD_CLASS_LABEL.to_string(), "gpu-training".to_string());
        p
    }

    fn classes() -> ClassTolerations {
        ClassTolerations::new(BTreeMap::from([(
            WorkloadClass::GpuTraining,
            vec![Toleration {
                key: Some("nvidia.com/gpu".to_string()),
                operator: TolerationOperator::Exists,
                value: None,
                effect: None,
            }],
        )]))
    }

    fn demand(class: WorkloadClass, urgency: Urgency, total: ResourceVector, per_unit: ResourceVector, workloads: u32) -> DemandVector {
        DemandVector {
            class,
            urgency,
            total,
            per_unit,
            workloads,
        }
    }

    fn cpu(millis: u64) -> ResourceVector {
        ResourceVector::new(millis, 0, 0)
    }

    fn ready(id: &str, pool: &str, shape: &str, allocated_cpu: u64) -> NodeRecord {
        let mut node = NodeRecord::provisioning(id, pool, shape, "zone-a", 0);
        node.state = NodeState::Ready;
        if allocated_cpu > 0 {
            node.workloads.push(AssignedWorkload {
                id: format!("{id}-w"),
                requests: cpu(allocated_cpu),
                system: false,
                migratable: true,
            });
        }
        node
    }

    #[test]
    fn nodes_needed_takes_ceiling_per_dimension() {
        let cap = ResourceVector::new(4000, 16_384, 0);
        assert_eq!(nodes_needed(&ResourceVector::new(9000, 1024, 0), &cap), Some(3));
        assert_eq!(nodes_needed(&ResourceVector::new(1000, 40_000, 0), &cap), Some(3));
        assert_eq!(nodes_needed(&ResourceVector::new(0, 0, 1), &cap), None);
        assert_eq!(nodes_needed(&ResourceVector::ZERO, &cap), Some(0));
    }

    #[test]
    fn single_node_scale_up_for_small_demand() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 1, 5)];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(3000), cpu(1000), 3)],
            &pools,
            &[],
        );

        assert_eq!(
            actions,
            vec![ScaleAction::ScaleUp {
                pool: "general".to_string(),
                shape: "m.large.spot".to_string(),
                count: 1,
                class: Some(WorkloadClass::General),
                urgency: Some(Urgency::Standard),
            }]
        );
    }

    #[test]
    fn demand_matching_free_capacity_needs_nothing() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 1, 5)];
        let nodes = vec![ready("n1", "general", "m.large.spot", 1000)];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(3000), cpu(1000), 3)],
            &pools,
            &nodes,
        );
        assert!(actions.is_empty(), "{actions:?}");
    }

    #[test]
    fn fragmented_free_capacity_does_not_cover_a_large_ask() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 5)];
        // 1500m free on each node: 3000m in total, but no node fits 2500m.
        let nodes = vec![
            ready("n1", "general", "m.large.spot", 2500),
            ready("n2", "general", "m.large.spot", 2500),
        ];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(2500), cpu(2500), 1)],
            &pools,
            &nodes,
        );
        assert_eq!(
            actions,
            vec![ScaleAction::ScaleUp {
                pool: "general".to_string(),
                shape: "m.large.spot".to_string(),
                count: 1,
                class: Some(WorkloadClass::General),
                urgency: Some(Urgency::Standard),
            }]
        );
    }

    #[test]
    fn small_asks_still_use_fragmented_capacity() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 5)];
        let nodes = vec![
            ready("n1", "general", "m.large.spot", 2500),
            ready("n2", "general", "m.large.spot", 2500),
        ];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(3000), cpu(1000), 3)],
            &pools,
            &nodes,
        );
        assert!(actions.is_empty(), "{actions:?}");
    }

    #[test]
    fn provisioning_nodes_count_as_in_flight() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 5)];
        let nodes = vec![NodeRecord::provisioning("n1", "general", "m.large.spot", "zone-a", 0)];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(4000), cpu(1000), 4)],
            &pools,
            &nodes,
        );
        assert!(actions.is_empty(), "{actions:?}");
    }

    #[test]
    fn headroom_bound_yields_scale_up_plus_shortfall() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 6)];

        // Ten units, each filling a whole node.
        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(40_000), cpu(4000), 10)],
            &pools,
            &[],
        );

        assert_eq!(actions.len(), 2, "{actions:?}");
        assert!(matches!(
            &actions[0],
            ScaleAction::ScaleUp { count: 6, .. }
        ));
        match &actions[1] {
            ScaleAction::Shortfall {
                missing_nodes,
                reason,
                pool,
                ..
            } => {
                assert_eq!(*missing_nodes, 4);
                assert_eq!(*reason, ShortfallReason::PoolAtMax);
                assert_eq!(pool.as_deref(), Some("general"));
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }

    #[test]
    fn spills_over_to_next_pool_by_weight() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let mut primary = pool("primary", &["m.large.spot"], 0, 2);
        primary.weight = 10;
        let overflow = pool("overflow", &["m.large.spot"], 0, 10);
        let pools = vec![overflow, primary];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(16_000), cpu(4000), 4)],
            &pools,
            &[],
        );

        let scale_ups: Vec<(&str, u32)> = actions
            .iter()
            .filter_map(|a| match a {
                ScaleAction::ScaleUp { pool, count, .. } => Some((pool.as_str(), *count)),
                _ => None,
            })
            .collect();
        assert_eq!(scale_ups, vec![("primary", 2), ("overflow", 2)]);
    }

    #[test]
    fn latency_critical_prefers_on_demand() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let p = pool("general", &["m.large", "m.large.spot"], 0, 5);

        let (shape, _) = reconciler
            .select_shape(&p, Urgency::LatencyCritical, &cpu(1000), &cpu(1000))
            .unwrap();
        assert_eq!(shape.id, "m.large");

        let (shape, _) = reconciler
            .select_shape(&p, Urgency::BestEffort, &cpu(1000), &cpu(1000))
            .unwrap();
        assert_eq!(shape.id, "m.large.spot");
    }

    #[test]
    fn falls_back_to_other_purchase_mode() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let p = pool("general", &["m.large"], 0, 5);

        let (shape, _) = reconciler
            .select_shape(&p, Urgency::Standard, &cpu(1000), &cpu(1000))
            .unwrap();
        assert_eq!(shape.id, "m.large");
    }

    #[test]
    fn cheapest_total_cost_wins() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let p = pool("general", &["m.large.spot", "m.xlarge.spot"], 0, 10);

        // 8 cores: two small (0.12) beat one large (0.14).
        let (shape, n) = reconciler
            .select_shape(&p, Urgency::Standard, &cpu(1000), &cpu(8000))
            .unwrap();
        assert_eq!((shape.id.as_str(), n), ("m.large.spot", 2));

        // A 6-core workload only fits the large shape.
        let (shape, _) = reconciler
            .select_shape(&p, Urgency::Standard, &cpu(6000), &cpu(6000))
            .unwrap();
        assert_eq!(shape.id, "m.xlarge.spot");
    }

    #[test]
    fn untolerated_class_has_no_matching_pool() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![gpu_pool(4)];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(1000), cpu(1000), 1)],
            &pools,
            &[],
        );
        assert!(matches!(
            actions.as_slice(),
            [ScaleAction::Shortfall {
                reason: ShortfallReason::NoMatchingPool,
                ..
            }]
        ));
    }

    #[test]
    fn gpu_demand_lands_on_gpu_pool() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 5), gpu_pool(4)];
        let ask = ResourceVector::new(4000, 32_768, 1);

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::GpuTraining, Urgency::Standard, ask.times(2), ask, 2)],
            &pools,
            &[],
        );
        assert_eq!(
            actions,
            vec![ScaleAction::ScaleUp {
                pool: "gpu".to_string(),
                shape: "g.xlarge".to_string(),
                count: 2,
                class: Some(WorkloadClass::GpuTraining),
                urgency: Some(Urgency::Standard),
            }]
        );
    }

    #[test]
    fn oversized_workload_has_no_eligible_shape() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 5)];

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(64_000), cpu(64_000), 1)],
            &pools,
            &[],
        );
        assert!(matches!(
            actions.as_slice(),
            [ScaleAction::Shortfall {
                reason: ShortfallReason::NoEligibleShape,
                ..
            }]
        ));
    }

    #[test]
    fn tops_up_pools_below_min_size() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large", "m.large.spot"], 2, 5)];

        let actions = reconciler.reconcile(&[], &pools, &[]);
        assert_eq!(
            actions,
            vec![ScaleAction::ScaleUp {
                pool: "general".to_string(),
                shape: "m.large.spot".to_string(),
                count: 2,
                class: None,
                urgency: None,
            }]
        );
    }

    #[test]
    fn draining_nodes_count_against_max_but_offer_no_capacity() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot"], 0, 1)];
        let mut draining = ready("n1", "general", "m.large.spot", 0);
        draining.state = NodeState::Draining;

        let actions = reconciler.reconcile(
            &[demand(WorkloadClass::General, Urgency::Standard, cpu(1000), cpu(1000), 1)],
            &pools,
            &[draining],
        );
        assert!(matches!(
            actions.as_slice(),
            [ScaleAction::Shortfall {
                reason: ShortfallReason::PoolAtMax,
                missing_nodes: 1,
                ..
            }]
        ));
    }

    #[test]
    fn reconcile_is_deterministic() {
        let catalog = catalog();
        let classes = classes();
        let reconciler = Reconciler::new(&catalog, &classes);
        let pools = vec![pool("general", &["m.large.spot", "m.xlarge.spot"], 1, 4), gpu_pool(2)];
        let demand = vec![
            demand(WorkloadClass::General, Urgency::BestEffort, cpu(9000), cpu(2000), 5),
            demand(WorkloadClass::General, Urgency::LatencyCritical, cpu(3000), cpu(1000), 3),
            demand(
                WorkloadClass::GpuTraining,
                Urgency::Standard,
                ResourceVector::new(24_000, 8192, 3),
                ResourceVector::new(8000, 4096, 1),
                3,
            ),
        ];

        let first = reconciler.reconcile(&demand, &pools, &[]);
        let second = reconciler.reconcile(&demand, &pools, &[]);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
