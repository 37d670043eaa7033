//! capgrid-state: embedded state store for capgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for node pools, node records, pending workloads and the
//! observability event log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! redb serializes write transactions, so every read-compare-write performed
//! inside one transaction is an atomic compare-and-swap. Node lifecycle
//! transitions, bounded inserts and event sequencing rely on this.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_secs};
pub use types::*;
