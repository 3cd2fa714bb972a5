//! Service discovery: service records, the nodes directory, presence/health
//! lookups, and liveness-filtered instance selection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, MemoryCache};
use crate::config::KEY_EXPIRATION_TTL;
use crate::coordinator::Coordinator;
use crate::error::DiscoveryError;
use crate::presence::{ServiceHealth, ServicePresence, ServiceRecord};
use crate::util::shuffled;

/// A live, shuffled roster entry — the type the message bus and HTTP
/// dispatcher resolve a service name down to before picking a target.
pub type ServiceInstance = PresenceEntry;

/// A [`ServicePresence`] decorated with the elapsed time since its last
/// update, for dashboards that want to show stale-but-not-yet-expired
/// instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEntry {
    /// The directory record itself.
    #[serde(flatten)]
    pub presence: ServicePresence,
    /// Seconds since `updatedOn`, computed at read time.
    pub elapsed: i64,
}

/// A live roster entry, decorated with the parsed timestamp used to sort
/// and compute elapsed time without re-parsing on every access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    /// The directory record.
    #[serde(flatten)]
    pub presence: ServicePresence,
    /// `updatedOn` parsed to a Unix timestamp (seconds).
    #[serde(rename = "updatedOnTS")]
    pub updated_on_ts: i64,
}

/// A fan-out result combining services, nodes, and health for every known
/// service, as returned by [`Discovery::get_service_health_all`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceHealthAll {
    /// Every registered service.
    pub services: Vec<ServiceRecord>,
    /// The full nodes directory.
    pub nodes: Vec<NodeEntry>,
    /// Per-service live health snapshots, keyed by service name.
    pub health: std::collections::BTreeMap<String, Vec<ServiceHealth>>,
}

/// Queries services, instances, health, and presence against the
/// coordinator, with a process-local cache for the hot paths.
pub struct Discovery {
    coordinator: Arc<dyn Coordinator>,
    cache: MemoryCache,
    key_prefix: String,
}

impl Discovery {
    /// Builds a discovery client over `coordinator`, using `key_prefix` as
    /// the keyspace root (matching [`crate::config::FabricConfig::key_prefix`]).
    pub fn new(coordinator: Arc<dyn Coordinator>, key_prefix: impl Into<String>) -> Self {
        Self {
            coordinator,
            cache: MemoryCache::new(),
            key_prefix: key_prefix.into(),
        }
    }

    /// All registered services.
    pub async fn get_services(&self) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let pattern = format!("{}:*:service", self.key_prefix);
        let keys = self.coordinator.keys(&pattern).await?;
        let mut services = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(json) = self.coordinator.get(&key).await? {
                if let Ok(record) = serde_json::from_str::<ServiceRecord>(&json) {
                    services.push(record);
                }
            }
        }
        Ok(services)
    }

    /// The entire nodes directory, each entry decorated with `elapsed`.
    pub async fn get_service_nodes(&self) -> Result<Vec<NodeEntry>, DiscoveryError> {
        let nodes_key = format!("{}:nodes", self.key_prefix);
        let entries = self.coordinator.hgetall(&nodes_key).await?;
        let now = Utc::now();
        let mut decorated = Vec::with_capacity(entries.len());
        for (_, json) in entries {
            if let Ok(presence) = serde_json::from_str::<ServicePresence>(&json) {
                let elapsed = elapsed_seconds(&presence.updated_on, now);
                decorated.push(NodeEntry { presence, elapsed });
            }
        }
        Ok(decorated)
    }

    /// The Service Record for `name`, failing with
    /// [`DiscoveryError::NotFound`] if it was never registered.
    pub async fn find_service(&self, name: &str) -> Result<ServiceRecord, DiscoveryError> {
        let key = format!("{}:{}:service", self.key_prefix, name.to_lowercase());
        let json = self
            .coordinator
            .get(&key)
            .await?
            .ok_or_else(|| DiscoveryError::NotFound(name.to_string()))?;
        serde_json::from_str(&json).map_err(|_| DiscoveryError::NotFound(name.to_string()))
    }

    /// The live, shuffled roster for `name`. Delegates to
    /// [`Discovery::check_service_presence`].
    pub async fn get_service_presence(
        &self,
        name: &str,
    ) -> Result<Vec<PresenceEntry>, DiscoveryError> {
        self.check_service_presence(name).await
    }

    /// `true` iff at least one live instance of `name` exists.
    pub async fn has_service_presence(&self, name: &str) -> Result<bool, DiscoveryError> {
        let pattern = format!("{}:{}:*:presence", self.key_prefix, name.to_lowercase());
        let keys = self.coordinator.keys(&pattern).await?;
        Ok(!keys.is_empty())
    }

    /// Re-verifies a single instance directly against both the presence key
    /// and its nodes-hash entry, bypassing the roster cache. Used by the
    /// HTTP dispatcher immediately before issuing a request, to guard
    /// against a stale cached roster.
    pub async fn instance_is_present(
        &self,
        service: &str,
        instance_id: &str,
    ) -> Result<bool, DiscoveryError> {
        let presence_key = format!(
            "{}:{}:{}:presence",
            self.key_prefix,
            service.to_lowercase(),
            instance_id
        );
        let nodes_key = format!("{}:nodes", self.key_prefix);
        let presence = self.coordinator.get(&presence_key).await?;
        let node = self.coordinator.hget(&nodes_key, instance_id).await?;
        Ok(presence.is_some() && node.is_some())
    }

    /// The live roster for `name`, via the process-local cache (TTL =
    /// presence TTL). On a cache miss, scans presence keys, multi-HGETs the
    /// nodes hash, drops entries with no directory record, and shuffles the
    /// result for client-side load balancing. The cache itself holds the
    /// unshuffled list so every call reshuffles a fresh copy.
    pub async fn check_service_presence(
        &self,
        name: &str,
    ) -> Result<Vec<PresenceEntry>, DiscoveryError> {
        let name = name.to_lowercase();
        let cache_key = format!("checkServicePresence:{name}");

        let unshuffled: Vec<PresenceEntry> =
            if let Some(cached) = self.cache.get::<Vec<PresenceEntry>>(&cache_key).await {
                cached
            } else {
                let fetched = self.fetch_service_presence(&name).await?;
                self.cache
                    .set(
                        &cache_key,
                        &fetched,
                        Some(Duration::from_secs(KEY_EXPIRATION_TTL)),
                    )
                    .await;
                fetched
            };

        Ok(shuffled(&unshuffled))
    }

    async fn fetch_service_presence(
        &self,
        name: &str,
    ) -> Result<Vec<PresenceEntry>, DiscoveryError> {
        let pattern = format!("{}:{}:*:presence", self.key_prefix, name);
        let keys = self.coordinator.keys(&pattern).await?;

        let instance_ids: Vec<String> = keys
            .iter()
            .filter_map(|key| key.split(':').nth(3).map(str::to_string))
            .collect();
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let nodes_key = format!("{}:nodes", self.key_prefix);
        let values = self.coordinator.hmget(&nodes_key, &instance_ids).await?;
        let now = Utc::now();

        let mut entries = Vec::new();
        for value in values.into_iter().flatten() {
            if let Ok(presence) = serde_json::from_str::<ServicePresence>(&value) {
                let updated_on_ts = epoch_seconds(&presence.updated_on, now);
                entries.push(PresenceEntry {
                    presence,
                    updated_on_ts,
                });
            }
        }
        Ok(entries)
    }

    /// Live health snapshots for `name`, cached with TTL = presence TTL.
    pub async fn get_service_health(&self, name: &str) -> Result<Vec<ServiceHealth>, DiscoveryError> {
        let name = name.to_lowercase();
        let cache_key = format!("getServiceHealth:{name}");
        if let Some(cached) = self.cache.get::<Vec<ServiceHealth>>(&cache_key).await {
            return Ok(cached);
        }

        let pattern = format!("{}:{}:*:health", self.key_prefix, name);
        let keys = self.coordinator.keys(&pattern).await?;
        let mut health = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(json) = self.coordinator.get(&key).await? {
                if let Ok(snapshot) = serde_json::from_str::<ServiceHealth>(&json) {
                    health.push(snapshot);
                }
            }
        }
        self.cache
            .set(
                &cache_key,
                &health,
                Some(Duration::from_secs(KEY_EXPIRATION_TTL)),
            )
            .await;
        Ok(health)
    }

    /// The health log for every live instance of `name`, newest entries
    /// first.
    pub async fn get_service_health_log(
        &self,
        name: &str,
    ) -> Result<Vec<crate::presence::HealthLogEntry>, DiscoveryError> {
        let pattern = format!("{}:{}:*:health:log", self.key_prefix, name.to_lowercase());
        let keys = self.coordinator.keys(&pattern).await?;
        let mut entries = Vec::new();
        for key in keys {
            let raw = self.coordinator.lrange(&key, 0, -1).await?;
            for json in raw {
                if let Ok(entry) = serde_json::from_str::<crate::presence::HealthLogEntry>(&json) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Fans `get_services`/`get_service_nodes`/`get_service_health` out
    /// across every known service.
    pub async fn get_service_health_all(&self) -> Result<ServiceHealthAll, DiscoveryError> {
        let services = self.get_services().await?;
        let nodes = self.get_service_nodes().await?;
        let mut health = std::collections::BTreeMap::new();
        for service in &services {
            let snapshots = self.get_service_health(&service.service_name).await?;
            health.insert(service.service_name.clone(), snapshots);
        }
        Ok(ServiceHealthAll {
            services,
            nodes,
            health,
        })
    }

    fn configs_key(&self, service: &str) -> String {
        format!("{}:{}:configs", self.key_prefix, service.to_lowercase())
    }

    /// Reads the configuration stored under `label` (a version tag, e.g.
    /// `"1.0.0"`) for `service`. A malformed (empty) label is a hard error
    /// rather than an undefined-field lookup.
    pub async fn get_config(
        &self,
        service: &str,
        label: &str,
    ) -> Result<Option<serde_json::Value>, DiscoveryError> {
        if label.trim().is_empty() {
            return Err(DiscoveryError::NotFound(format!(
                "{service} config label must not be empty"
            )));
        }
        let key = self.configs_key(service);
        match self.coordinator.hget(&key, label).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)))),
            None => Ok(None),
        }
    }

    /// Writes `config` under `label` for `service`.
    pub async fn put_config(
        &self,
        service: &str,
        label: &str,
        config: &serde_json::Value,
    ) -> Result<(), DiscoveryError> {
        let key = self.configs_key(service);
        let raw = serde_json::to_string(config)
            .map_err(|e| DiscoveryError::Coordinator(crate::error::CoordinatorError::Decode(e.to_string())))?;
        self.coordinator.hset(&key, label, &raw).await?;
        Ok(())
    }

    /// Every version label stored for `service`, sorted.
    pub async fn list_config(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        let key = self.configs_key(service);
        let entries = self.coordinator.hgetall(&key).await?;
        let mut labels: Vec<String> = entries.into_iter().map(|(field, _)| field).collect();
        labels.sort();
        Ok(labels)
    }
}

fn epoch_seconds(iso: &str, fallback_now: DateTime<Utc>) -> i64 {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|_| fallback_now.timestamp())
}

fn elapsed_seconds(iso: &str, now: DateTime<Utc>) -> i64 {
    match DateTime::parse_from_rfc3339(iso) {
        Ok(dt) => (now.timestamp() - dt.with_timezone(&Utc).timestamp()).max(0),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use crate::presence::PresenceEngine;
    use tokio::sync::broadcast;

    async fn registered_discovery(service_name: &str) -> (Discovery, Arc<dyn Coordinator>) {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let mut config = crate::config::FabricConfig::new(service_name).unwrap();
        config.service_port = 5000;
        config.service_ip = "127.0.0.1".to_string();
        config.service_type = "test".to_string();
        let (tx, _rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(&coordinator), config, tx);
        engine.register_service().await.unwrap();
        (Discovery::new(Arc::clone(&coordinator), "hydra:service"), coordinator)
    }

    #[tokio::test]
    async fn find_service_returns_registered_record() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        let record = discovery.find_service("test-service").await.unwrap();
        assert_eq!(record.service_type, "test");
    }

    #[tokio::test]
    async fn find_service_errors_with_contract_message() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        let err = discovery.find_service("billing").await.unwrap_err();
        assert_eq!(err.to_string(), "Can't find billing service");
    }

    #[tokio::test]
    async fn get_services_includes_registered_service() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        let services = discovery.get_services().await.unwrap();
        assert!(services.iter().any(|s| s.service_name == "test-service"));
    }

    #[tokio::test]
    async fn check_service_presence_finds_live_instance() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        let presence = discovery.check_service_presence("test-service").await.unwrap();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].presence.service_name, "test-service");
    }

    #[tokio::test]
    async fn has_service_presence_is_false_for_unknown_service() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        assert!(!discovery.has_service_presence("nope").await.unwrap());
        assert!(discovery.has_service_presence("test-service").await.unwrap());
    }

    #[tokio::test]
    async fn put_then_get_config_round_trips() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        discovery
            .put_config("test-service", "1.0.0", &serde_json::json!({"k": "v"}))
            .await
            .unwrap();
        let config = discovery.get_config("test-service", "1.0.0").await.unwrap();
        assert_eq!(config, Some(serde_json::json!({"k": "v"})));
    }

    #[tokio::test]
    async fn get_config_missing_label_returns_none() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        let config = discovery.get_config("test-service", "9.9.9").await.unwrap();
        assert_eq!(config, None);
    }

    #[tokio::test]
    async fn get_config_empty_label_is_a_hard_error() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        assert!(discovery.get_config("test-service", "").await.is_err());
    }

    #[tokio::test]
    async fn list_config_returns_sorted_labels() {
        let (discovery, _coord) = registered_discovery("test-service").await;
        discovery
            .put_config("test-service", "2.0.0", &serde_json::json!({}))
            .await
            .unwrap();
        discovery
            .put_config("test-service", "1.0.0", &serde_json::json!({}))
            .await
            .unwrap();
        let labels = discovery.list_config("test-service").await.unwrap();
        assert_eq!(labels, vec!["1.0.0".to_string(), "2.0.0".to_string()]);
    }
}
