//! capgrid.toml parser and compiler.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use capgrid_policy::{
    AllowList, CircuitBreaker, Gateway, GatewayRule, MtlsMode, PolicyEngine, Scope, TrafficPolicy,
};
use capgrid_state::{
    CapacityShape, NodePoolSpec, NodeRecord, ScaleDownPolicy, Taint, Toleration, WorkloadClass,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::CapacityCatalog;
use crate::classes::ClassTolerations;
use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::settings::{ControllerSection, ControllerSettings};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub shapes: Vec<CapacityShape>,
    #[serde(default)]
    pub pools: Vec<PoolSection>,
    /// Keyed by workload class name (`general`, `gpu-training`, `gpu-inference`).
    #[serde(default)]
    pub classes: BTreeMap<String, ClassSection>,
    #[serde(default)]
    pub mesh: MeshSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    pub name: String,
    pub shapes: Vec<String>,
    #[serde(default)]
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub weight: i32,
    pub scale_down: ScaleDownPolicy,
    #[serde(default = "default_utilization_threshold")]
    pub utilization_threshold: f64,
    #[serde(default = "default_consolidate_after")]
    pub consolidate_after: String,
    #[serde(default = "default_disruption_grace")]
    pub disruption_grace: String,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_utilization_threshold() -> f64 {
    0.5
}
fn default_consolidate_after() -> String {
    "10m".to_string()
}
fn default_disruption_grace() -> String {
    "5m".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassSection {
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshSection {
    #[serde(default)]
    pub policies: Vec<MeshPolicySection>,
}

/// One `[[mesh.policies]]` entry. No namespace means the system default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshPolicySection {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub class: Option<WorkloadClass>,
    #[serde(default)]
    pub mtls: Option<MtlsMode>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSection>,
    #[serde(default)]
    pub allow: Option<AllowList>,
    #[serde(default)]
    pub loosen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    pub max_pending_requests: u32,
    pub consecutive_errors: u32,
    pub ejection_window: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub rules: Vec<GatewayRule>,
}

/// A fully validated document, ready to apply.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub settings: ControllerSettings,
    pub catalog: CapacityCatalog,
    pub pools: Vec<NodePoolSpec>,
    pub classes: ClassTolerations,
    pub traffic: PolicyEngine,
    pub gateway: Gateway,
}

impl PolicyDocument {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse and compile in one step.
    pub fn load(path: &Path) -> ConfigResult<CompiledPolicy> {
        Self::from_file(path)?.compile()
    }

    /// Validate the whole document and build the runtime structures.
    pub fn compile(&self) -> ConfigResult<CompiledPolicy> {
        let mut errors = Vec::new();

        let settings = self.controller.compile(&mut errors);
        let catalog = self.compile_shapes(&mut errors);
        let pools = self.compile_pools(&catalog, &mut errors);
        let classes = self.compile_classes(&mut errors);
        let traffic = self.compile_mesh(&mut errors);
        let gateway = match Gateway::new(self.gateway.rules.clone()) {
            Ok(gateway) => gateway,
            Err(e) => {
                errors.push(format!("gateway: {e}"));
                Gateway::default()
            }
        };

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }
        debug!(
            shapes = catalog.len(),
            pools = pools.len(),
            traffic_policies = traffic.len(),
            gateway_rules = gateway.len(),
            "policy document compiled"
        );
        Ok(CompiledPolicy {
            settings,
            catalog,
            pools,
            classes,
            traffic,
            gateway,
        })
    }

    fn compile_shapes(&self, errors: &mut Vec<String>) -> CapacityCatalog {
        let mut seen = BTreeSet::new();
        for shape in &self.shapes {
            let at = format!("shape {:?}", shape.id);
            if shape.id.trim().is_empty() {
                errors.push("shape id must not be empty".to_string());
            }
            if !seen.insert(shape.id.as_str()) {
                errors.push(format!("{at}: duplicate id"));
            }
            if shape.cpu_millis == 0 || shape.memory_mib == 0 {
                errors.push(format!("{at}: cpu_millis and memory_mib must be positive"));
            }
            if shape.zones.is_empty() {
                errors.push(format!("{at}: at least one zone is required"));
            }
            if !shape.hourly_cost.is_finite() || shape.hourly_cost < 0.0 {
                errors.push(format!("{at}: hourly_cost must be a non-negative number"));
            }
            if shape.gpu_type.is_some() && shape.gpus == 0 {
                errors.push(format!("{at}: gpu_type set without gpus"));
            }
        }
        CapacityCatalog::new(self.shapes.iter().cloned())
    }

    fn compile_classes(&self, errors: &mut Vec<String>) -> ClassTolerations {
        let mut tolerations = BTreeMap::new();
        for (name, section) in &self.classes {
            match name.parse::<WorkloadClass>() {
                Ok(class) => {
                    tolerations.insert(class, section.tolerations.clone());
                }
                Err(e) => errors.push(format!("classes: {e}")),
            }
        }
        ClassTolerations::new(tolerations)
    }

    fn compile_pools(&self, catalog: &CapacityCatalog, errors: &mut Vec<String>) -> Vec<NodePoolSpec> {
        let mut seen = BTreeSet::new();
        let mut pools = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            let at = format!("pool {:?}", pool.name);
            if pool.name.trim().is_empty() {
                errors.push("pool name must not be empty".to_string());
            }
            if !seen.insert(pool.name.as_str()) {
                errors.push(format!("{at}: duplicate name"));
            }
            if pool.shapes.is_empty() {
                errors.push(format!("{at}: no eligible shapes"));
            }
            for shape in &pool.shapes {
                if !catalog.contains(shape) {
                    errors.push(format!("{at}: unknown shape {shape:?}"));
                }
            }
            if pool.min_size > pool.max_size {
                errors.push(format!(
                    "{at}: min_size {} exceeds max_size {}",
                    pool.min_size, pool.max_size
                ));
            }
            if !(pool.utilization_threshold > 0.0 && pool.utilization_threshold <= 1.0) {
                errors.push(format!("{at}: utilization_threshold must be in (0, 1]"));
            }
            if pool.taints.iter().any(|t| t.key.trim().is_empty()) {
                errors.push(format!("{at}: taint key must not be empty"));
            }
            let consolidate_after = parse_duration(&pool.consolidate_after).unwrap_or_else(|| {
                errors.push(format!(
                    "{at}: invalid consolidate_after {:?}",
                    pool.consolidate_after
                ));
                Default::default()
            });
            let grace = parse_duration(&pool.disruption_grace).unwrap_or_else(|| {
                errors.push(format!(
                    "{at}: invalid disruption_grace {:?}",
                    pool.disruption_grace
                ));
                Default::default()
            });

            pools.push(NodePoolSpec {
                name: pool.name.clone(),
                shapes: pool.shapes.clone(),
                min_size: pool.min_size,
                max_size: pool.max_size,
                weight: pool.weight,
                scale_down: pool.scale_down,
                utilization_threshold: pool.utilization_threshold,
                consolidate_after_secs: consolidate_after.as_secs(),
                disruption_grace_secs: grace.as_secs(),
                taints: pool.taints.clone(),
                labels: pool.labels.clone(),
            });
        }
        pools
    }

    fn compile_mesh(&self, errors: &mut Vec<String>) -> PolicyEngine {
        let mut policies = Vec::with_capacity(self.mesh.policies.len());
        for (idx, section) in self.mesh.policies.iter().enumerate() {
            let scope = match (&section.namespace, section.class) {
                (None, None) => Scope::Default,
                (Some(ns), None) => Scope::namespace(ns),
                (Some(ns), Some(class)) => Scope::class(ns, class),
                (None, Some(_)) => {
                    errors.push(format!("mesh.policies[{idx}]: class requires a namespace"));
                    continue;
                }
            };
            let circuit_breaker = match &section.circuit_breaker {
                None => None,
                Some(cb) => match parse_duration(&cb.ejection_window) {
                    Some(window) => Some(CircuitBreaker {
                        max_pending_requests: cb.max_pending_requests,
                        consecutive_errors: cb.consecutive_errors,
                        ejection_window_secs: window.as_secs(),
                    }),
                    None => {
                        errors.push(format!(
                            "mesh.policies[{idx}]: invalid ejection_window {:?}",
                            cb.ejection_window
                        ));
                        None
                    }
                },
            };
            policies.push(TrafficPolicy {
                scope,
                mtls: section.mtls,
                circuit_breaker,
                allow: section.allow.clone(),
                loosen: section.loosen.clone(),
            });
        }

        let policy_errors = capgrid_policy::validate_all(&policies);
        if !policy_errors.is_empty() {
            errors.extend(policy_errors.into_iter().map(|e| format!("mesh: {e}")));
            return PolicyEngine::default();
        }
        match PolicyEngine::new(policies) {
            Ok(engine) => engine,
            Err(e) => {
                errors.push(format!("mesh: {e}"));
                PolicyEngine::default()
            }
        }
    }
}

impl CompiledPolicy {
    pub fn pool(&self, name: &str) -> Option<&NodePoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Check that live nodes remain consistent with this policy before it
    /// replaces the running one.
    pub fn check_live_nodes(&self, nodes: &[NodeRecord]) -> Vec<String> {
        let mut errors = Vec::new();
        for node in nodes.iter().filter(|n| n.state.is_active()) {
            match self.pool(&node.pool) {
                None => errors.push(format!(
                    "node {}: pool {:?} removed while the node is active",
                    node.id, node.pool
                )),
                Some(pool) if !pool.is_eligible(&node.shape) => errors.push(format!(
                    "node {}: shape {:?} no longer eligible for pool {:?}",
                    node.id, node.shape, node.pool
                )),
                Some(_) => {}
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_state::NodeState;

    const SAMPLE: &str = r#"
[controller]
observe_interval = "15s"
consolidation_interval = "5m"

[[shapes]]
id = "m.large.spot"
cpu_millis = 4000
memory_mib = 16384
purchase = "spot"
zones = ["zone-a", "zone-b"]
hourly_cost = 0.06

[[shapes]]
id = "g.xlarge"
cpu_millis = 8000
memory_mib = 65536
gpus = 1
gpu_type = "a10g"
purchase = "on-demand"
zones = ["zone-a"]
hourly_cost = 1.2

[[pools]]
name = "general"
shapes = ["m.large.spot"]
min_size = 1
max_size = 5
scale_down = "WhenUnderutilized"

[[pools]]
name = "gpu"
shapes = ["g.xlarge"]
max_size = 4
scale_down = "when-empty"
disruption_grace = "10m"
taints = [{ key = "nvidia.com/gpu", effect = "NoSchedule" }]

[classes.gpu-training]
tolerations = [{ key = "nvidia.com/gpu", operator = "Exists" }]

[[mesh.policies]]
mtls = "strict"

[[mesh.policies]]
namespace = "ml"
class = "gpu-inference"
allow = { namespaces = ["web"] }

[[gateway.rules]]
host = "*.example.com"
namespace = "web"
service = "frontend"
port = 8080
expose = true
"#;

    #[test]
    fn sample_document_compiles() {
        let compiled = PolicyDocument::parse(SAMPLE).unwrap().compile().unwrap();
        assert_eq!(compiled.catalog.len(), 2);
        assert_eq!(compiled.pools.len(), 2);

        let general = compiled.pool("general").unwrap();
        assert_eq!(general.consolidate_after_secs, 600);
        assert_eq!(general.utilization_threshold, 0.5);
        assert_eq!(compiled.pool("gpu").unwrap().disruption_grace_secs, 600);

        let gpu = compiled.pool("gpu").unwrap();
        assert!(compiled.classes.accepts(WorkloadClass::GpuTraining, gpu));
        assert!(!compiled.classes.accepts(WorkloadClass::General, gpu));
        assert_eq!(compiled.traffic.len(), 2);
        assert_eq!(compiled.gateway.len(), 1);
    }

    #[test]
    fn all_errors_are_collected() {
        let doc = PolicyDocument::parse(
            r#"
[[pools]]
name = "general"
shapes = ["missing"]
min_size = 3
max_size = 1
scale_down = "when-empty"
consolidate_after = "forever"

[[mesh.policies]]
mtls = "permissive"
"#,
        )
        .unwrap();

        let err = doc.compile().unwrap_err();
        let messages = err.messages();
        assert_eq!(messages.len(), 4, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("unknown shape")));
        assert!(messages.iter().any(|m| m.contains("min_size")));
        assert!(messages.iter().any(|m| m.contains("consolidate_after")));
        assert!(messages.iter().any(|m| m.contains("strict")));
    }

    #[test]
    fn class_without_namespace_is_rejected() {
        let doc = PolicyDocument::parse(
            r#"
[[mesh.policies]]
class = "general"
"#,
        )
        .unwrap();
        assert!(matches!(doc.compile(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let doc = PolicyDocument::parse("[classes.cpu-heavy]\n").unwrap();
        let err = doc.compile().unwrap_err();
        assert!(err.to_string().contains("unknown workload class"));
    }

    #[test]
    fn live_nodes_block_incompatible_reload() {
        let compiled = PolicyDocument::parse(SAMPLE).unwrap().compile().unwrap();
        let mut node = NodeRecord::provisioning("n1", "general", "g.xlarge", "zone-a", 0);
        assert_eq!(compiled.check_live_nodes(&[node.clone()]).len(), 1);

        node.state = NodeState::Terminated;
        assert!(compiled.check_live_nodes(&[node]).is_empty());
    }

    #[test]
    fn from_file_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgrid.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let compiled = PolicyDocument::load(&path).unwrap();
        assert_eq!(compiled.settings.consolidation_interval.as_secs(), 300);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PolicyDocument::from_file(Path::new("/nonexistent/capgrid.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
