//! capgrid-controller: one place that owns every component.
//!
//! # Architecture
//!
//! ```text
//! Controller
//!   ├── reconcile loop   observe → Reconciler::reconcile → ActionExecutor
//!   │                    (interval tick or out-of-band Notify)
//!   ├── disruption loop  resume orphaned drains → consolidation → prune
//!   ├── InterruptionHandler (event-driven, from the API)
//!   └── policy           validated CompiledPolicy, swapped on reload
//! ```
//!
//! All components receive their settings from an explicit
//! [`ControllerConfig`] at construction.

pub mod config;
pub mod controller;
pub mod error;

pub use config::ControllerConfig;
pub use controller::{Controller, PolicySummary, PoolStatus, ReconcileReport, StatusReport};
pub use error::{ControlError, ControlResult};
