//! Prometheus text exposition format.

use std::collections::BTreeMap;

use capgrid_state::{NodePoolSpec, NodeRecord, NodeState};

const STATES: [NodeState; 4] = [
    NodeState::Provisioning,
    NodeState::Ready,
    NodeState::Draining,
    NodeState::Terminated,
];

/// Render event counters, node gauges and pool bounds.
pub fn render_prometheus(
    counters: &BTreeMap<&'static str, u64>,
    pools: &[NodePoolSpec],
    nodes: &[NodeRecord],
) -> String {
    let mut out = String::new();

    out.push_str("# HELP capgrid_events_total Events emitted since process start.\n");
    out.push_str("# TYPE capgrid_events_total counter\n");
    for (kind, count) in counters {
        out.push_str(&format!("capgrid_events_total{{type=\"{kind}\"}} {count}\n"));
    }

    out.push_str("# HELP capgrid_nodes Nodes by pool and lifecycle state.\n");
    out.push_str("# TYPE capgrid_nodes gauge\n");
    for pool in pools {
        for state in STATES {
            let count = nodes
                .iter()
                .filter(|n| n.pool == pool.name && n.state == state)
                .count();
            out.push_str(&format!(
                "capgrid_nodes{{pool=\"{}\",state=\"{}\"}} {}\n",
                pool.name, state, count
            ));
        }
    }

    out.push_str("# HELP capgrid_pool_min_size Configured minimum pool size.\n");
    out.push_str("# TYPE capgrid_pool_min_size gauge\n");
    for pool in pools {
        out.push_str(&format!(
            "capgrid_pool_min_size{{pool=\"{}\"}} {}\n",
            pool.name, pool.min_size
        ));
    }

    out.push_str("# HELP capgrid_pool_max_size Configured maximum pool size.\n");
    out.push_str("# TYPE capgrid_pool_max_size gauge\n");
    for pool in pools {
        out.push_str(&format!(
            "capgrid_pool_max_size{{pool=\"{}\"}} {}\n",
            pool.name, pool.max_size
        ));
    }

    out.push_str("# HELP capgrid_workloads_bound Workloads bound to active nodes.\n");
    out.push_str("# TYPE capgrid_workloads_bound gauge\n");
    for pool in pools {
        let bound: usize = nodes
            .iter()
            .filter(|n| n.pool == pool.name && n.state.is_active())
            .map(|n| n.workloads.len())
            .sum();
        out.push_str(&format!(
            "capgrid_workloads_bound{{pool=\"{}\"}} {}\n",
            pool.name, bound
        ));
    }

    out
}
