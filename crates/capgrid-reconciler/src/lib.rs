//! capgrid-reconciler: decides what capacity to add and adds it.
//!
//! # Architecture
//!
//! ```text
//! Reconciler::reconcile(demand, pools, nodes)   pure, deterministic
//!   └── Vec<ScaleAction>  (ScaleUp | Shortfall)
//!
//! ActionExecutor::execute(actions)
//!   ├── emits ScaleUpPlanned / CapacityShortfall once per action
//!   ├── pools run concurrently, actions within a pool sequentially
//!   └── Provisioner calls bounded by a timeout, retried with backoff
//! ```

pub mod error;
pub mod executor;
pub mod plan;
pub mod provisioner;

pub use error::{ProvisionError, ProvisionResult};
pub use executor::{ActionExecutor, ActionOutcome, ExecutorConfig};
pub use plan::{Reconciler, ScaleAction, nodes_needed};
pub use provisioner::{BoxFuture, ProvisionedNode, Provisioner, SimulatedProvisioner};
