//! Demand Observer.
//!
//! Reads the pending workloads reported by the cluster scheduler and
//! folds them into one [`DemandVector`] per (class, urgency) bucket.
//! Observation has no side effects and may be called concurrently.

pub mod observer;

pub use observer::{DemandObserver, DemandSnapshot, DemandVector, NodeUsage, aggregate};
