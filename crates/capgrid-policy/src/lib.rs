//! capgrid traffic policy: mesh security and ingress rules.
//!
//! # Components
//!
//! - **`model`**: Scoped traffic policies, circuit breakers, allow lists
//! - **`engine`**: Validation and most-specific-wins resolution
//! - **`gateway`**: Host-based ingress with exact > wildcard precedence

pub mod engine;
pub mod error;
pub mod gateway;
pub mod model;

pub use engine::{EffectivePolicy, PolicyEngine, RequestContext, validate, validate_all};
pub use error::{PolicyError, PolicyResult};
pub use gateway::{Gateway, GatewayRule, Ingress, RouteTarget};
pub use model::{AllowList, CircuitBreaker, MtlsMode, Scope, TrafficPolicy};
