//! Crate-wide error taxonomy.
//!
//! Each fabric component gets its own error enum so callers matching on a
//! specific operation don't have to wade through variants that can never
//! occur there. [`FabricError`] is the facade-level union every component
//! error converts into.

use thiserror::Error;

/// Errors from the coordinator client (the shared key/value + pub/sub store).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The coordinator connection could not be established or was lost.
    #[error("coordinator connection error: {0}")]
    Connection(String),
    /// A command against the coordinator failed.
    #[error("coordinator command failed: {0}")]
    Command(String),
    /// A stored value could not be decoded as the expected shape.
    #[error("coordinator payload decode error: {0}")]
    Decode(String),
}

/// Errors from the presence/health lifecycle.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// `registerService` was called twice, or before configuration completed.
    #[error("presence engine not initialized")]
    NotInitialized,
    /// The coordinator rejected a presence or health write.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from service discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `findService` found no service record with that name.
    #[error("Can't find {0} service")]
    NotFound(String),
    /// The coordinator rejected a discovery query.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the route registry.
#[derive(Debug, Error)]
pub enum RoutesError {
    /// A route pattern could not be compiled into a matcher.
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),
    /// The coordinator rejected a route registration.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The outgoing message failed UMF validation.
    #[error("UMF message requires 'to', 'from' and 'body' fields")]
    InvalidMessage,
    /// The `to` field could not be parsed into a route.
    #[error("route parse error: {0}")]
    RouteParse(String),
    /// The message could not be JSON-encoded for publishing.
    #[error("UMF payload encode error: {0}")]
    Encode(String),
    /// The coordinator rejected a publish or subscribe call.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the queue engine.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The message failed UMF validation before being queued.
    #[error("UMF message requires 'to', 'from' and 'body' fields")]
    InvalidMessage,
    /// The queued payload could not be JSON-encoded or decoded.
    #[error("queue payload codec error: {0}")]
    Codec(String),
    /// The coordinator rejected a queue operation.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the HTTP dispatch engine.
///
/// Most dispatch failures are not represented here: per §7 of the fabric
/// contract, a malformed request or an unavailable service resolves to a
/// synthetic HTTP response rather than an `Err`. This enum covers only the
/// failures that have no sensible HTTP-shaped representation.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The underlying HTTP client failed in a way that isn't a normal
    /// instance-unreachable failover case (e.g. the request body couldn't be
    /// built).
    #[error("dispatch request build error: {0}")]
    RequestBuild(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration field was missing.
    #[error("missing required configuration field: {0}")]
    MissingField(String),
    /// A configuration field had an invalid value.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// An environment override could not be parsed.
    #[error("invalid environment override: {0}")]
    Environment(String),
    /// A TOML config file could not be read or parsed.
    #[error("toml config error: {0}")]
    Toml(String),
}

/// The facade-level error union.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Configuration failed to load.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The coordinator itself is unreachable or misbehaving.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    /// A presence/health lifecycle operation failed.
    #[error(transparent)]
    Presence(#[from] PresenceError),
    /// A discovery query failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// A route registration failed.
    #[error(transparent)]
    Routes(#[from] RoutesError),
    /// A bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A dispatch request could not even be built (not a per-attempt
    /// instance failure — those resolve as data, see [`DispatchResponse`]).
    ///
    /// [`DispatchResponse`]: crate::dispatch::DispatchResponse
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// The fabric was asked to act before `registerService` completed.
    #[error("fabric not initialized")]
    NotInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_not_found_message_matches_contract() {
        let err = DiscoveryError::NotFound("billing".to_string());
        assert_eq!(err.to_string(), "Can't find billing service");
    }

    #[test]
    fn coordinator_error_converts_into_fabric_error() {
        let err: FabricError = CoordinatorError::Connection("refused".into()).into();
        assert!(matches!(err, FabricError::Coordinator(_)));
    }

    #[test]
    fn presence_error_wraps_coordinator_error() {
        let err: PresenceError = CoordinatorError::Command("EXEC failed".into()).into();
        assert!(matches!(err, PresenceError::Coordinator(_)));
    }
}
