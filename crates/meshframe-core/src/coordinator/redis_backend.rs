//! Redis-backed coordinator.
//!
//! Built on `redis::aio::ConnectionManager`, which already gives us
//! auto-reconnect on connection loss — the coordinator contract's
//! `reconnecting`/`end`/`error` events are folded into that behavior rather
//! than re-implemented here. Atomic multi-key writes (presence tick, health
//! tick, route registration) run as a single `redis::pipe().atomic()`
//! pipeline so they execute as one round-trip, matching a Redis
//! `MULTI`/`EXEC`.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;

use super::{BoxFuture, Coordinator, CoordinatorOp, Subscription};
use crate::error::CoordinatorError;

fn cmd_err(e: redis::RedisError) -> CoordinatorError {
    CoordinatorError::Command(e.to_string())
}

/// A coordinator backed by a real Redis (or Redis-compatible) server.
pub struct RedisCoordinator {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisCoordinator {
    /// Connects to `url` (a `redis://` or `rediss://` URL) and returns a
    /// coordinator handle backed by a multiplexed connection manager.
    ///
    /// With the `resilience` feature on, the connection attempt runs behind
    /// a [`crate::resilience::CircuitBreaker`] and retries with backoff:
    /// the breaker guards the reconnect path itself (per §5 of the fabric
    /// contract), never the individual commands issued once connected —
    /// those fail or succeed on their own, same as any other
    /// `ConnectionManager` user.
    #[cfg(feature = "resilience")]
    pub async fn connect(url: &str) -> Result<Self, CoordinatorError> {
        use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor};

        let breaker = CircuitBreaker::new("coordinator-connect", CircuitBreakerConfig::default());
        breaker
            .check()
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;

        let executor = RetryExecutor::new(RetryConfig::new(3));
        let url_owned = url.to_string();
        let result = executor
            .execute("coordinator-connect", move || {
                let url = url_owned.clone();
                async move { Self::connect_once(&url).await }
            })
            .await;

        match result {
            Ok(coordinator) => {
                breaker.record_success();
                Ok(coordinator)
            }
            Err(retry_err) => {
                breaker.record_failure();
                Err(retry_err.last_error)
            }
        }
    }

    /// Connects without the resilience wrapper; available unconditionally
    /// so the `resilience` feature can be compiled out without losing the
    /// ability to connect at all.
    #[cfg(not(feature = "resilience"))]
    pub async fn connect(url: &str) -> Result<Self, CoordinatorError> {
        Self::connect_once(url).await
    }

    async fn connect_once(url: &str) -> Result<Self, CoordinatorError> {
        let client =
            redis::Client::open(url).map_err(|e| CoordinatorError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoordinatorError::Connection(e.to_string()))?;
        Ok(Self { manager, client })
    }
}

impl Coordinator for RedisCoordinator {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.get(&key).await.map_err(cmd_err) })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.set(&key, &value).await.map_err(cmd_err) })
    }

    fn setex(
        &self,
        key: &str,
        ttl_secs: u64,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.set_ex(&key, &value, ttl_secs).await.map_err(cmd_err) })
    }

    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let removed: i64 = conn.del(&key).await.map_err(cmd_err)?;
            Ok(removed > 0)
        })
    }

    fn expire(&self, key: &str, ttl_secs: u64) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = conn.expire(&key, ttl_secs as i64).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>> {
        let key = key.to_string();
        let field = field.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.hget(&key, &field).await.map_err(cmd_err) })
    }

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = conn.hset(&key, &field, &value).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<Vec<(String, String)>, CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let map: std::collections::HashMap<String, String> =
                conn.hgetall(&key).await.map_err(cmd_err)?;
            Ok(map.into_iter().collect())
        })
    }

    fn hdel(&self, key: &str, field: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let field = field.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: i64 = conn.hdel(&key, &field).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> BoxFuture<'_, Result<Vec<Option<String>>, CoordinatorError>> {
        let key = key.to_string();
        let fields = fields.to_vec();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            if fields.is_empty() {
                return Ok(Vec::new());
            }
            conn.hget(&key, fields).await.map_err(cmd_err)
        })
    }

    fn smembers(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.smembers(&key).await.map_err(cmd_err) })
    }

    fn lpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: i64 = conn.lpush(&key, &value).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: i64 = conn.rpush(&key, &value).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn rpoplpush(
        &self,
        src: &str,
        dst: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>> {
        let src = src.to_string();
        let dst = dst.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move { conn.rpoplpush(&src, &dst).await.map_err(cmd_err) })
    }

    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.lrange(&key, start as isize, stop as isize)
                .await
                .map_err(cmd_err)
        })
    }

    fn lrem(
        &self,
        key: &str,
        count: i64,
        value: &str,
    ) -> BoxFuture<'_, Result<i64, CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.lrem(&key, count as isize, &value).await.map_err(cmd_err)
        })
    }

    fn ltrim(&self, key: &str, start: i64, stop: i64) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = conn
                .ltrim(&key, start as isize, stop as isize)
                .await
                .map_err(cmd_err)?;
            Ok(())
        })
    }

    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let pattern = pattern.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let opts = redis::ScanOptions::default().with_pattern(&pattern).with_count(100);
            let mut found = Vec::new();
            let mut iter: redis::AsyncIter<'_, String> =
                conn.scan_options(opts).await.map_err(cmd_err)?;
            use futures_core::Stream;
            use std::pin::Pin;
            let mut iter = Pin::new(&mut iter);
            while let Some(key) = futures_next(iter.as_mut()).await {
                found.push(key);
            }
            Ok(found)
        })
    }

    fn publish(&self, channel: &str, payload: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: i64 = conn.publish(&channel, &payload).await.map_err(cmd_err)?;
            Ok(())
        })
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Result<Subscription, CoordinatorError>> {
        let channel = channel.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| CoordinatorError::Connection(e.to_string()))?;
            pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| CoordinatorError::Connection(e.to_string()))?;

            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(async move {
                use futures_core::Stream;
                use std::pin::Pin;
                let mut stream = Pin::new(&mut pubsub.on_message());
                while let Some(msg) = futures_next(stream.as_mut()).await {
                    let channel: String = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    if tx.send((channel, payload)).await.is_err() {
                        break;
                    }
                }
            });

            Ok(rx)
        })
    }

    fn atomic(&self, ops: Vec<CoordinatorOp>) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in ops {
                match op {
                    CoordinatorOp::Set { key, value } => {
                        pipe.set(key, value);
                    }
                    CoordinatorOp::SetEx {
                        key,
                        ttl_secs,
                        value,
                    } => {
                        pipe.set_ex(key, value, ttl_secs);
                    }
                    CoordinatorOp::Del { key } => {
                        pipe.del(key);
                    }
                    CoordinatorOp::Expire { key, ttl_secs } => {
                        pipe.expire(key, ttl_secs as i64);
                    }
                    CoordinatorOp::HSet { key, field, value } => {
                        pipe.hset(key, field, value);
                    }
                    CoordinatorOp::SAdd { key, members } => {
                        pipe.sadd(key, members);
                    }
                }
            }
            pipe.query_async::<()>(&mut conn).await.map_err(cmd_err)
        })
    }

    fn duplicate(&self) -> Arc<dyn Coordinator> {
        Arc::new(Self {
            manager: self.manager.clone(),
            client: self.client.clone(),
        })
    }

    /// Issues `QUIT` on this handle's connection. `ConnectionManager` owns a
    /// multiplexed background task and reconnects automatically on its own,
    /// so `QUIT` (rather than a stateful disconnect call the manager doesn't
    /// expose) is the closest this backend gets to an explicit close — it's
    /// only ever called during shutdown, after which nothing issues another
    /// command on this handle.
    fn close(&self) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = redis::cmd("QUIT").query_async(&mut conn).await.map_err(cmd_err)?;
            Ok(())
        })
    }
}

/// Thin wrapper so we don't pull in the full `futures` crate for a single
/// `StreamExt::next` call.
async fn futures_next<S: futures_core::Stream + Unpin>(mut stream: std::pin::Pin<&mut S>) -> Option<S::Item> {
    std::future::poll_fn(move |cx| stream.as_mut().poll_next(cx)).await
}

/// A Lua script template kept for reference: route-registration's
/// delete-then-repopulate could be expressed as a single server-side script
/// instead of a pipeline if repopulation ever needs to read the old set
/// first. Not currently used — the pipeline above covers every atomic batch
/// this crate issues.
#[allow(dead_code)]
static REPLACE_SET_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
for i = 1, #ARGV do
  redis.call('SADD', KEYS[1], ARGV[i])
end
return 1
"#;

#[allow(dead_code)]
fn replace_set_script() -> Script {
    Script::new(REPLACE_SET_SCRIPT)
}
