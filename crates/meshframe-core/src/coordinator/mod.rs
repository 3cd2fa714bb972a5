//! The coordinator client contract: the one shared dependency every other
//! fabric component talks through.
//!
//! A coordinator is a key/value store with hashes, sets, lists, TTLs,
//! pattern scanning, and publish/subscribe — the shape Redis exposes. Two
//! implementations ship here: [`memory::MemoryCoordinator`] (no external
//! process, backs the test suite) and, behind the `coordinator-redis`
//! feature, [`redis_backend::RedisCoordinator`].

mod memory;
#[cfg(feature = "coordinator-redis")]
mod redis_backend;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use memory::MemoryCoordinator;
#[cfg(feature = "coordinator-redis")]
pub use redis_backend::RedisCoordinator;

pub use crate::error::CoordinatorError;

/// A boxed, `Send` future, matching the pattern used by [`crate::cache::Cache`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receiving half of a pub/sub subscription: yields `(channel, payload)`.
pub type Subscription = tokio::sync::mpsc::Receiver<(String, String)>;

/// A single operation in an [`Coordinator::atomic`] batch.
///
/// Grouping these into one call is what lets the presence tick, health
/// tick, and route registration each execute as a single round-trip
/// (`MULTI`/`EXEC` on the Redis backend).
#[derive(Debug, Clone)]
pub enum CoordinatorOp {
    /// `SET key value`.
    Set {
        /// Target key.
        key: String,
        /// Value to store.
        value: String,
    },
    /// `SETEX key ttl_secs value`.
    SetEx {
        /// Target key.
        key: String,
        /// Time-to-live in seconds.
        ttl_secs: u64,
        /// Value to store.
        value: String,
    },
    /// `DEL key`.
    Del {
        /// Key to delete.
        key: String,
    },
    /// `EXPIRE key ttl_secs`.
    Expire {
        /// Target key.
        key: String,
        /// New time-to-live in seconds.
        ttl_secs: u64,
    },
    /// `HSET key field value`.
    HSet {
        /// Target hash key.
        key: String,
        /// Field within the hash.
        field: String,
        /// Value to store.
        value: String,
    },
    /// `SADD key member…`, replacing the set's contents is the caller's
    /// responsibility (pair with a `Del` in the same batch).
    SAdd {
        /// Target set key.
        key: String,
        /// Members to add.
        members: Vec<String>,
    },
}

/// The coordinator client contract.
///
/// All methods return a boxed future so the trait stays object-safe and can
/// be shared behind `Arc<dyn Coordinator>` — every fabric component holds
/// one such handle.
pub trait Coordinator: Send + Sync {
    /// `GET key`.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>>;
    /// `SET key value`, no expiry.
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// `SETEX key ttl_secs value`.
    fn setex(
        &self,
        key: &str,
        ttl_secs: u64,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// `DEL key`. Returns true iff the key existed.
    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinatorError>>;
    /// `EXPIRE key ttl_secs`.
    fn expire(&self, key: &str, ttl_secs: u64) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// `HGET key field`.
    fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>>;
    /// `HSET key field value`.
    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// `HGETALL key`.
    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<Vec<(String, String)>, CoordinatorError>>;
    /// `HDEL key field`.
    fn hdel(&self, key: &str, field: &str) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// Values for `fields` from the hash at `key`, in order; missing fields
    /// decode as `None`. Backs discovery's multi-`HGET` of the nodes hash.
    fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> BoxFuture<'_, Result<Vec<Option<String>>, CoordinatorError>>;
    /// `SMEMBERS key`.
    fn smembers(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>>;
    /// `LPUSH key value`.
    fn lpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// `RPUSH key value`.
    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// Atomically moves the tail of `src` to the head of `dst`, returning
    /// the moved value.
    fn rpoplpush(
        &self,
        src: &str,
        dst: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>>;
    /// `LRANGE key start stop`.
    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>>;
    /// `LREM key count value`. Returns the number of elements removed.
    fn lrem(
        &self,
        key: &str,
        count: i64,
        value: &str,
    ) -> BoxFuture<'_, Result<i64, CoordinatorError>>;
    /// `LTRIM key start stop`, keeping only the inclusive range. Backs the
    /// health log's cap at [`crate::config::MAX_ENTRIES_IN_HEALTH_LOG`].
    fn ltrim(&self, key: &str, start: i64, stop: i64) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// Keys matching `pattern` (`*` wildcard). The Redis backend accumulates
    /// `SCAN`/`COUNT=100` batches until the cursor returns to zero; callers
    /// never see the difference.
    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>>;
    /// `PUBLISH channel payload`.
    fn publish(&self, channel: &str, payload: &str) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// Subscribes to `channel`, returning the receiving half of the
    /// delivery channel.
    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Result<Subscription, CoordinatorError>>;
    /// Executes `ops` as a single atomic round-trip.
    fn atomic(&self, ops: Vec<CoordinatorOp>) -> BoxFuture<'_, Result<(), CoordinatorError>>;
    /// Opens a new, independent handle to the same backing store. Used by
    /// the message bus's publisher pool (one cloned connection per
    /// channel).
    fn duplicate(&self) -> Arc<dyn Coordinator>;
    /// Closes this handle's connection. Called last during fabric shutdown,
    /// after pub/sub and publisher handles are closed and the presence key
    /// is deleted. A no-op for backends with nothing to close.
    fn close(&self) -> BoxFuture<'_, Result<(), CoordinatorError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_coordinator_round_trips_basic_get_set() {
        let coord = MemoryCoordinator::new();
        coord.set("k", "v").await.unwrap();
        assert_eq!(coord.get("k").await.unwrap(), Some("v".to_string()));
    }
}
