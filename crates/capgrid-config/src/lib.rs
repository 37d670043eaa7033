//! capgrid configuration: the `capgrid.toml` policy document.
//!
//! The document is parsed with serde, then compiled into typed runtime
//! structures. Compilation validates everything up front and reports
//! every problem at once; nothing is applied from a document that fails.

pub mod catalog;
pub mod classes;
pub mod document;
pub mod duration;
pub mod error;
pub mod settings;

pub use catalog::CapacityCatalog;
pub use classes::{ClassTolerations, WORKLOAD_CLASS_LABEL};
pub use document::{CompiledPolicy, PolicyDocument};
pub use duration::{MAX_DURATION, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use settings::{ControllerSettings, TerminateWhen};
