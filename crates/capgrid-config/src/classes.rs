//! Workload-class isolation: which pools a class may land on.

use std::collections::BTreeMap;

use capgrid_state::{NodePoolSpec, Toleration, WorkloadClass};

/// Pool label that pins a pool to one workload class.
pub const WORKLOAD_CLASS_LABEL: &str = "capgrid.io/workload-class";

/// Tolerations carried by each workload class.
#[derive(Debug, Clone, Default)]
pub struct ClassTolerations {
    tolerations: BTreeMap<WorkloadClass, Vec<Toleration>>,
}

impl ClassTolerations {
    pub fn new(tolerations: BTreeMap<WorkloadClass, Vec<Toleration>>) -> Self {
        Self { tolerations }
    }

    pub fn tolerations(&self, class: WorkloadClass) -> &[Toleration] {
        self.tolerations
            .get(&class)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// A pool accepts a class when every hard taint is tolerated and the
    /// pool's class label, if any, names the class.
    pub fn accepts(&self, class: WorkloadClass, pool: &NodePoolSpec) -> bool {
        if let Some(pinned) = pool.labels.get(WORKLOAD_CLASS_LABEL)
            && pinned != class.as_str()
        {
            return false;
        }
        let tolerations = self.tolerations(class);
        pool.taints
            .iter()
            .filter(|taint| taint.effect.is_hard())
            .all(|taint| tolerations.iter().any(|t| t.tolerates(taint)))
    }
}
