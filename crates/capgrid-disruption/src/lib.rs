//! capgrid-disruption: taking nodes out of service.
//!
//! # Components
//!
//! - **`drainer`**: Per-node drain tasks: cordon, evict, wait, terminate
//! - **`consolidation`**: Picks empty or underutilized nodes to remove
//! - **`interruption`**: Reacts to capacity-reclaim notices
//! - **`evictor`**: The workload-scheduler collaborator
//!
//! Every drain begins with a compare-and-swap into `Draining`; whoever
//! loses the race does nothing, except an interruption, which shortens
//! the running drain's deadline instead. Voluntary drains check `min_size`
//! under the same lock as the swap.

pub mod consolidation;
pub mod drainer;
pub mod error;
pub mod evictor;
pub mod interruption;

pub use consolidation::{ConsolidationPlanner, DrainAction, plan};
pub use drainer::{DrainConfig, DrainStart, Drainer};
pub use error::{DisruptionError, DisruptionResult};
pub use evictor::{Evictor, RecordingEvictor, ReportedEvictor};
pub use interruption::InterruptionHandler;
