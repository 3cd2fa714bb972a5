//! In-memory coordinator backend.
//!
//! Backs the test suite (and any deployment that doesn't want a Redis
//! dependency) with the same contract the Redis backend exposes. Expiry is
//! checked lazily at read time, matching [`crate::cache::memory::MemoryCache`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::{BoxFuture, Coordinator, CoordinatorOp, Subscription};
use crate::error::CoordinatorError;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn fresh(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn with_ttl(value: String, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() > at).unwrap_or(false)
    }
}

#[derive(Default)]
struct Store {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    channels: HashMap<String, Vec<mpsc::Sender<(String, String)>>>,
}

/// An in-memory stand-in for the coordinator contract.
pub struct MemoryCoordinator {
    store: Arc<Mutex<Store>>,
}

impl MemoryCoordinator {
    /// Creates an empty coordinator.
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    fn apply_op(store: &mut Store, op: CoordinatorOp) {
        match op {
            CoordinatorOp::Set { key, value } => {
                store.strings.insert(key, Entry::fresh(value));
            }
            CoordinatorOp::SetEx {
                key,
                ttl_secs,
                value,
            } => {
                store.strings.insert(key, Entry::with_ttl(value, ttl_secs));
            }
            CoordinatorOp::Del { key } => {
                store.strings.remove(&key);
                store.hashes.remove(&key);
                store.lists.remove(&key);
            }
            CoordinatorOp::Expire { key, ttl_secs } => {
                if let Some(entry) = store.strings.get_mut(&key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                }
            }
            CoordinatorOp::HSet { key, field, value } => {
                store.hashes.entry(key).or_default().insert(field, value);
            }
            CoordinatorOp::SAdd { key, members } => {
                let set = store.lists.entry(key).or_default();
                for member in members {
                    if !set.contains(&member) {
                        set.push(member);
                    }
                }
            }
        }
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

impl Coordinator for MemoryCoordinator {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            Ok(store
                .strings
                .get(&key)
                .filter(|e| !e.is_expired())
                .map(|e| e.value.clone()))
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            store.strings.insert(key, Entry::fresh(value));
            Ok(())
        })
    }

    fn setex(
        &self,
        key: &str,
        ttl_secs: u64,
        value: &str,
    ) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            store.strings.insert(key, Entry::with_ttl(value, ttl_secs));
            Ok(())
        })
    }

    fn del(&self, key: &str) -> BoxFuture<'_, Result<bool, CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            let had = store.strings.remove(&key).is_some()
                || store.hashes.remove(&key).is_some()
                || store.lists.remove(&key).is_some();
            Ok(had)
        })
    }

    fn expire(&self, key: &str, ttl_secs: u64) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            if let Some(entry) = store.strings.get_mut(&key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
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
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            Ok(store
                .hashes
                .get(&key)
                .and_then(|h| h.get(&field))
                .cloned())
        })
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
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            store.hashes.entry(key).or_default().insert(field, value);
            Ok(())
        })
    }

    fn hgetall(&self, key: &str) -> BoxFuture<'_, Result<Vec<(String, String)>, CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            Ok(store
                .hashes
                .get(&key)
                .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default())
        })
    }

    fn hdel(&self, key: &str, field: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let field = field.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            if let Some(h) = store.hashes.get_mut(&key) {
                h.remove(&field);
            }
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
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            let hash = store.hashes.get(&key);
            Ok(fields
                .iter()
                .map(|f| hash.and_then(|h| h.get(f)).cloned())
                .collect())
        })
    }

    fn smembers(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            Ok(store.lists.get(&key).cloned().unwrap_or_default())
        })
    }

    fn lpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            store.lists.entry(key).or_default().insert(0, value);
            Ok(())
        })
    }

    fn rpush(&self, key: &str, value: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            store.lists.entry(key).or_default().push(value);
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
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            let popped = store.lists.get_mut(&src).and_then(|l| l.pop());
            if let Some(value) = &popped {
                store.lists.entry(dst).or_default().insert(0, value.clone());
            }
            Ok(popped)
        })
    }

    fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            let list = store.lists.get(&key).cloned().unwrap_or_default();
            Ok(slice_range(&list, start, stop))
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
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            let Some(list) = store.lists.get_mut(&key) else {
                return Ok(0);
            };
            let mut removed = 0i64;
            if count >= 0 {
                let limit = if count == 0 { usize::MAX } else { count as usize };
                list.retain(|v| {
                    if (removed as usize) < limit && v == &value {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
            } else {
                let limit = (-count) as usize;
                let mut idxs: Vec<usize> = list
                    .iter()
                    .enumerate()
                    .rev()
                    .filter(|(_, v)| *v == &value)
                    .map(|(i, _)| i)
                    .take(limit)
                    .collect();
                idxs.sort_unstable();
                for idx in idxs.into_iter().rev() {
                    list.remove(idx);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn ltrim(&self, key: &str, start: i64, stop: i64) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            if let Some(list) = store.lists.get_mut(&key) {
                let trimmed = slice_range(list, start, stop);
                *list = trimmed;
            }
            Ok(())
        })
    }

    fn keys(&self, pattern: &str) -> BoxFuture<'_, Result<Vec<String>, CoordinatorError>> {
        let pattern = pattern.to_string();
        Box::pin(async move {
            let store = self.store.lock().unwrap();
            let mut matches: Vec<String> = store
                .strings
                .iter()
                .filter(|(_, v)| !v.is_expired())
                .map(|(k, _)| k.clone())
                .chain(store.hashes.keys().cloned())
                .chain(store.lists.keys().cloned())
                .filter(|k| glob_match(&pattern, k))
                .collect();
            matches.sort();
            matches.dedup();
            Ok(matches)
        })
    }

    fn publish(&self, channel: &str, payload: &str) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        Box::pin(async move {
            let senders = {
                let store = self.store.lock().unwrap();
                store.channels.get(&channel).cloned().unwrap_or_default()
            };
            for sender in senders {
                let _ = sender.try_send((channel.clone(), payload.clone()));
            }
            Ok(())
        })
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Result<Subscription, CoordinatorError>> {
        let channel = channel.to_string();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(256);
            let mut store = self.store.lock().unwrap();
            store.channels.entry(channel).or_default().push(tx);
            Ok(rx)
        })
    }

    fn atomic(&self, ops: Vec<CoordinatorOp>) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        Box::pin(async move {
            let mut store = self.store.lock().unwrap();
            for op in ops {
                Self::apply_op(&mut store, op);
            }
            Ok(())
        })
    }

    fn duplicate(&self) -> Arc<dyn Coordinator> {
        Arc::new(Self {
            store: Arc::clone(&self.store),
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoordinatorError>> {
        Box::pin(async move { Ok(()) })
    }
}

fn slice_range(list: &[String], start: i64, stop: i64) -> Vec<String> {
    let len = list.len() as i64;
    if len == 0 {
        return Vec::new();
    }
    let norm = |i: i64| -> i64 {
        if i < 0 {
            (len + i).max(0)
        } else {
            i.min(len - 1).max(0)
        }
    };
    let start = norm(start);
    let stop = norm(stop);
    if start > stop || start >= len {
        return Vec::new();
    }
    list[start as usize..=(stop as usize).min(list.len() - 1)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setex_expires_after_ttl() {
        let coord = MemoryCoordinator::new();
        coord.setex("k", 0, "v").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(coord.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_roundtrip() {
        let coord = MemoryCoordinator::new();
        coord.hset("h", "f", "v").await.unwrap();
        assert_eq!(coord.hget("h", "f").await.unwrap(), Some("v".to_string()));
        let all = coord.hgetall("h").await.unwrap();
        assert_eq!(all, vec![("f".to_string(), "v".to_string())]);
    }

    #[tokio::test]
    async fn hmget_returns_none_for_missing_fields() {
        let coord = MemoryCoordinator::new();
        coord.hset("h", "a", "1").await.unwrap();
        let results = coord
            .hmget("h", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(results, vec![Some("1".to_string()), None]);
    }

    #[tokio::test]
    async fn rpoplpush_moves_tail_to_head() {
        let coord = MemoryCoordinator::new();
        coord.rpush("src", "a").await.unwrap();
        coord.rpush("src", "b").await.unwrap();
        let moved = coord.rpoplpush("src", "dst").await.unwrap();
        assert_eq!(moved, Some("b".to_string()));
        assert_eq!(coord.lrange("dst", 0, -1).await.unwrap(), vec!["b"]);
        assert_eq!(coord.lrange("src", 0, -1).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn lrem_removes_last_occurrence_with_negative_count() {
        let coord = MemoryCoordinator::new();
        for v in ["a", "b", "a", "c", "a"] {
            coord.rpush("list", v).await.unwrap();
        }
        let removed = coord.lrem("list", -1, "a").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            coord.lrange("list", 0, -1).await.unwrap(),
            vec!["a", "b", "a", "c"]
        );
    }

    #[tokio::test]
    async fn keys_matches_glob_pattern() {
        let coord = MemoryCoordinator::new();
        coord.set("hydra:service:alpha:service", "x").await.unwrap();
        coord.set("hydra:service:beta:service", "x").await.unwrap();
        coord.set("other", "x").await.unwrap();
        let mut keys = coord.keys("*:service").await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "hydra:service:alpha:service".to_string(),
                "hydra:service:beta:service".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn publish_subscribe_delivers_payload() {
        let coord = MemoryCoordinator::new();
        let mut sub = coord.subscribe("chan").await.unwrap();
        coord.publish("chan", "hello").await.unwrap();
        let (channel, payload) = sub.recv().await.unwrap();
        assert_eq!(channel, "chan");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn atomic_applies_all_ops_together() {
        let coord = MemoryCoordinator::new();
        coord
            .atomic(vec![
                CoordinatorOp::SetEx {
                    key: "presence".to_string(),
                    ttl_secs: 3,
                    value: "id".to_string(),
                },
                CoordinatorOp::HSet {
                    key: "nodes".to_string(),
                    field: "id".to_string(),
                    value: "{}".to_string(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(coord.get("presence").await.unwrap(), Some("id".to_string()));
        assert_eq!(coord.hget("nodes", "id").await.unwrap(), Some("{}".to_string()));
    }

    #[tokio::test]
    async fn duplicate_shares_underlying_store() {
        let coord = MemoryCoordinator::new();
        let dup = coord.duplicate();
        coord.set("k", "v").await.unwrap();
        assert_eq!(dup.get("k").await.unwrap(), Some("v".to_string()));
    }
}
