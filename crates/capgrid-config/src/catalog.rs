//! Capacity Catalog: the static set of purchasable compute shapes.

use std::collections::BTreeMap;

use capgrid_state::{CapacityShape, NodePoolSpec, PurchaseMode};

/// Immutable catalog keyed by shape id. Loaded once per policy document.
#[derive(Debug, Clone, Default)]
pub struct CapacityCatalog {
    shapes: BTreeMap<String, CapacityShape>,
}

impl CapacityCatalog {
    /// Build a catalog. Later duplicates are rejected by validation, not here.
    pub fn new(shapes: impl IntoIterator<Item = CapacityShape>) -> Self {
        Self {
            shapes: shapes.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&CapacityShape> {
        self.shapes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shapes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapacityShape> {
        self.shapes.values()
    }

    /// Shapes a pool may provision, in the pool's declared order.
    pub fn shapes_for<'a, 'p>(
        &'a self,
        pool: &'p NodePoolSpec,
    ) -> impl Iterator<Item = &'a CapacityShape> + use<'a, 'p> {
        pool.shapes.iter().filter_map(|id| self.shapes.get(id))
    }

    /// Shapes of a pool restricted to one purchase mode.
    pub fn shapes_for_mode<'a, 'p>(
        &'a self,
        pool: &'p NodePoolSpec,
        mode: PurchaseMode,
    ) -> impl Iterator<Item = &'a CapacityShape> + use<'a, 'p> {
        self.shapes_for(pool).filter(move |s| s.purchase == mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_state::ScaleDownPolicy;

    fn shape(id: &str, purchase: PurchaseMode) -> CapacityShape {
        CapacityShape {
            id: id.to_string(),
            cpu_millis: 4000,
            memory_mib: 16_384,
            gpus: 0,
            gpu_type: None,
            purchase,
            zones: vec!["zone-a".to_string()],
            hourly_cost: 0.1,
        }
    }

    #[test]
    fn shapes_for_pool_skip_unknown_ids() {
        let catalog = CapacityCatalog::new([
            shape("m.large", PurchaseMode::OnDemand),
            shape("m.large.spot", PurchaseMode::Spot),
        ]);
        let pool = NodePoolSpec {
            name: "general".to_string(),
            shapes: vec![
                "m.large.spot".to_string(),
                "ghost".to_string(),
                "m.large".to_string(),
            ],
            min_size: 0,
            max_size: 3,
            weight: 0,
            scale_down: ScaleDownPolicy::WhenEmpty,
            utilization_threshold: 0.5,
            consolidate_after_secs: 600,
            disruption_grace_secs: 300,
            taints: Vec::new(),
            labels: Default::default(),
        };

        let ids: Vec<&str> = catalog.shapes_for(&pool).map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["m.large.spot", "m.large"]);

        let spot: Vec<&str> = catalog
            .shapes_for_mode(&pool, PurchaseMode::Spot)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(spot, vec!["m.large.spot"]);
    }
}
