//! Observability bootstrap for fabric instances.
//!
//! Every instance emits structured `tracing` events for presence ticks,
//! health ticks, dispatch failover, and plugin lifecycle transitions. This
//! module only wires up the subscriber; the actual sink (stdout, OTLP
//! collector, a log aggregator) is the operator's choice and lives outside
//! this crate.

mod builder;

pub use builder::{Observability, ObservabilityBuilder, ObservabilityError, ObservabilityGuard};
