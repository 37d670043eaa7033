//! capgrid-feed: the observability sink.
//!
//! # Architecture
//!
//! ```text
//! EventFeed
//!   ├── emit() → StateStore::append_event (seq assigned in the write txn)
//!   │           → broadcast to live subscribers
//!   ├── since() → replay from the persisted log
//!   └── counters() → per-kind totals since process start
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod feed;
pub mod prometheus;

pub use feed::EventFeed;
pub use prometheus::render_prometheus;
