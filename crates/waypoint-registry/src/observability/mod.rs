//! Observability Module
//!
//! - `events`: structured lifecycle events with a stable `event_type` field
//! - `metrics`: counters and gauges recorded through the `metrics` facade
//! - `tracing`: subscriber setup for binaries embedding the registry

pub mod events;
pub mod metrics;
pub mod tracing;

pub use metrics::register_metric_descriptions;
pub use tracing::{init_tracing, TracingConfig};
