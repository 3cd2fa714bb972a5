//! # Meshframe Core
//!
//! A lightweight service mesh fabric built on a shared coordinator store.
//!
//! Every instance of a service announces itself on a presence key, publishes
//! periodic health snapshots, and registers the HTTP routes it serves. Peers
//! discover each other through the same coordinator, so the "mesh" has no
//! dedicated control-plane process: the coordinator (Redis, or an in-memory
//! stand-in for tests) is the only shared piece of infrastructure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshframe_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     println!("meshframe - one fabric, many instances.");
//! }
//! ```

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

/// Unified Message Format: the envelope carried over the bus, queues, and
/// HTTP dispatch.
pub mod umf;

/// String hashing, shuffling, and other small helpers shared across modules.
pub mod util;

/// The coordinator client contract and its backends.
pub mod coordinator;

/// Cache abstraction used for the discovery layer's local presence cache.
pub mod cache;

/// Service configuration loaded from the coordinator and the environment.
pub mod config;

/// Error types shared across the fabric.
pub mod error;

/// Presence and health lifecycle: announcing, renewing, and retiring an
/// instance.
pub mod presence;

/// Service discovery: resolving a healthy, presence-shuffled instance for a
/// named service.
pub mod discovery;

/// Route registry: registering and matching an instance's HTTP routes.
pub mod routes;

/// Publish/subscribe message bus.
pub mod bus;

/// Durable-ish FIFO queues layered on the coordinator.
pub mod queue;

/// HTTP dispatch engine: resolves a target instance and performs the
/// request, retrying across instances on failure.
pub mod dispatch;

/// Plugin host: serial lifecycle hooks run around fabric operations.
pub mod plugin;

/// The fabric facade: the single entry point gluing presence, discovery,
/// routing, bus, queue, and dispatch together.
pub mod facade;

/// Dependency health check infrastructure (ambient, process-level).
#[cfg(feature = "health")]
pub mod health;

/// Observability bootstrap.
#[cfg(feature = "otel")]
pub mod otel;

/// Graceful shutdown utilities.
pub mod shutdown;

/// Resilience patterns wrapping the coordinator client.
#[cfg(feature = "resilience")]
pub mod resilience;

// ============================================================================
// Re-exported dependencies
// ============================================================================
// These re-exports allow consumers to use common dependencies without adding
// them explicitly to their Cargo.toml.

/// Re-export chrono for date/time handling
pub use chrono;
/// Re-export dashmap for concurrent hash maps
#[cfg(feature = "cache-memory")]
pub use dashmap;
/// Re-export moka for high-performance caching
#[cfg(feature = "cache-memory")]
pub use moka;
/// Re-export opentelemetry for full observability
#[cfg(feature = "otel-otlp")]
pub use opentelemetry;
/// Re-export opentelemetry_otlp for OTLP exporter
#[cfg(feature = "otel-otlp")]
pub use opentelemetry_otlp;
/// Re-export opentelemetry_sdk for SDK configuration
#[cfg(feature = "otel-otlp")]
pub use opentelemetry_sdk;
/// Re-export parking_lot for efficient synchronization primitives
pub use parking_lot;
/// Re-export rand for random number generation
pub use rand;
/// Re-export redis for the coordinator's Redis backend
#[cfg(feature = "coordinator-redis")]
pub use redis;
/// Re-export reqwest for the HTTP dispatch engine
pub use reqwest;
/// Re-export serde for serialization
pub use serde;
/// Re-export serde_json for JSON handling
pub use serde_json;
/// Re-export tokio for async runtime
pub use tokio;
/// Re-export tracing for observability
#[cfg(feature = "otel")]
pub use tracing;
/// Re-export tracing_opentelemetry for tracing integration
#[cfg(feature = "otel-otlp")]
pub use tracing_opentelemetry;
/// Re-export tracing_subscriber for log configuration
#[cfg(feature = "otel-otlp")]
pub use tracing_subscriber;
/// Re-export uuid for instance identity generation
pub use uuid;

/// Prelude module for convenient imports
///
/// Commonly used imports for meshframe applications
pub mod prelude {
    /// Re-export cache utilities
    pub use crate::cache::{Cache, CacheConfig, CacheKey, MemoryCache};
    /// Re-export coordinator client
    pub use crate::coordinator::{Coordinator, CoordinatorError};
    /// Re-export the fabric facade
    pub use crate::facade::{Fabric, FabricBuilder, FabricError, FabricEvent};
    /// Re-export discovery
    pub use crate::discovery::{Discovery, DiscoveryError, ServiceInstance};
    /// Re-export dispatch
    pub use crate::dispatch::{DispatchError, DispatchResponse, Dispatcher};
    /// Re-export the message bus
    pub use crate::bus::{BusSendOutcome, MessageBus};
    /// Re-export queues
    pub use crate::queue::{Queue, QueueError};
    /// Re-export presence
    pub use crate::presence::{InstanceIdentity, PresenceEngine, PresenceError};
    /// Re-export route registry
    pub use crate::routes::{PathMatcher, RouteRegistry};
    /// Re-export the UMF envelope
    pub use crate::umf::{ParsedRoute, UmfMessage};
    /// Re-export the coordinator subscription handle
    pub use crate::coordinator::Subscription;
    /// Re-export the plugin host
    pub use crate::plugin::{Plugin, PluginHost};
    /// Re-export health check utilities
    #[cfg(feature = "health")]
    pub use crate::health::{
        Dependency, DependencyStatus, HealthCheck, HealthReport, HealthServer, OverallStatus,
        SimpleHealthCheck,
    };
    /// Re-export shutdown utilities
    pub use crate::shutdown::{
        GracefulShutdown, GracefulShutdownExt, ShutdownAwareTaskSpawner, ShutdownSignal,
        ShutdownToken,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_meshframe_core_exists() {
        assert!(true);
    }
}
