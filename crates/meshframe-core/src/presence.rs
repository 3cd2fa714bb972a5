//! Presence and health lifecycle: registration, periodic refresh, and clean
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::{
    FabricConfig, HEALTH_LOG_TTL, HEALTH_UPDATE_INTERVAL, KEY_EXPIRATION_TTL,
    PRESENCE_UPDATE_INTERVAL,
};
use crate::coordinator::{Coordinator, CoordinatorOp};
use crate::error::PresenceError;
use crate::facade::FabricEvent;
use crate::util::new_instance_id;

/// The instance identity chosen at startup.
///
/// This crate adopts a random UUIDv4 (dashes stripped) rather than an MD5
/// hash of `ip:port`, so two instances can share a host without colliding
/// (see `DESIGN.md`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// The instance ID string. Opaque to clients.
    pub instance_id: String,
    /// OS process ID, used in health snapshots.
    pub process_id: u32,
    /// Local host name, used in health snapshots and the nodes hash.
    pub host_name: String,
}

impl InstanceIdentity {
    /// Generates a fresh identity for this process.
    pub fn generate() -> Self {
        Self {
            instance_id: new_instance_id(),
            process_id: std::process::id(),
            host_name: hostname(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// The Service Record: one per service name, written on register, never
/// expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    /// Lower-cased service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Free-form service type.
    #[serde(rename = "type")]
    pub service_type: String,
    /// ISO-8601 registration timestamp.
    #[serde(rename = "registeredOn")]
    pub registered_on: String,
}

/// A ServicePresence entry in the Nodes Hash: a directory record for an
/// instance that has ever registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePresence {
    /// Lower-cased service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Free-form human description.
    #[serde(rename = "serviceDescription")]
    pub service_description: String,
    /// Service version string.
    pub version: String,
    /// This instance's ID.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// ISO-8601 timestamp of the last presence tick.
    #[serde(rename = "updatedOn")]
    pub updated_on: String,
    /// OS process ID.
    #[serde(rename = "processID")]
    pub process_id: u32,
    /// Advertised IP or DNS name.
    pub ip: String,
    /// Advertised port.
    pub port: u16,
    /// Host name.
    #[serde(rename = "hostName")]
    pub host_name: String,
}

/// Memory usage snapshot embedded in [`ServiceHealth`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MemorySnapshot {
    /// Resident set size, bytes.
    pub rss: u64,
    /// Heap total, bytes (0 on platforms without a managed heap to report).
    #[serde(rename = "heapTotal")]
    pub heap_total: u64,
    /// Heap used, bytes.
    #[serde(rename = "heapUsed")]
    pub heap_used: u64,
    /// External (non-heap) allocations, bytes.
    pub external: u64,
}

/// The Health Key payload: a point-in-time runtime snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    /// Lower-cased service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// This instance's ID.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// Host name.
    #[serde(rename = "hostName")]
    pub host_name: String,
    /// ISO-8601 sample timestamp.
    #[serde(rename = "sampledOn")]
    pub sampled_on: String,
    /// OS process ID.
    #[serde(rename = "processID")]
    pub process_id: u32,
    /// CPU architecture (`std::env::consts::ARCH`).
    pub architecture: String,
    /// OS platform (`std::env::consts::OS`).
    pub platform: String,
    /// Service version string.
    pub version: String,
    /// Memory usage snapshot.
    pub memory: MemorySnapshot,
    /// Seconds since this instance started.
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
}

/// An entry in the capped Health Log list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthLogEntry {
    /// ISO-8601 timestamp.
    pub ts: String,
    /// Lower-cased service name.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Free-form log level/type (`"info"`, `"error"`, …).
    #[serde(rename = "type")]
    pub entry_type: String,
    /// OS process ID.
    #[serde(rename = "processID")]
    pub process_id: u32,
    /// Log message text.
    pub msg: String,
}

/// Result of a successful [`PresenceEngine::register_service`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Lower-cased service name.
    pub service_name: String,
    /// Advertised IP/DNS.
    pub service_ip: String,
    /// Advertised port.
    pub service_port: u16,
}

struct KeySet {
    service_record: String,
    presence: String,
    health: String,
    health_log: String,
    nodes: String,
}

fn build_keys(prefix: &str, service: &str, instance_id: &str) -> KeySet {
    KeySet {
        service_record: format!("{prefix}:{service}:service"),
        presence: format!("{prefix}:{service}:{instance_id}:presence"),
        health: format!("{prefix}:{service}:{instance_id}:health"),
        health_log: format!("{prefix}:{service}:{instance_id}:health:log"),
        nodes: format!("{prefix}:nodes"),
    }
}

/// Drives the presence/health lifecycle for one instance: registration,
/// periodic ticks, and clean shutdown.
pub struct PresenceEngine {
    coordinator: Arc<dyn Coordinator>,
    config: FabricConfig,
    identity: InstanceIdentity,
    keys: KeySet,
    started_at: Instant,
    closing: Arc<AtomicBool>,
    presence_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<FabricEvent>,
}

impl PresenceEngine {
    /// Builds a presence engine for `config`, generating a fresh instance
    /// identity.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: FabricConfig,
        events: broadcast::Sender<FabricEvent>,
    ) -> Self {
        let identity = InstanceIdentity::generate();
        let keys = build_keys(
            &config.key_prefix,
            &config.normalized_service_name(),
            &identity.instance_id,
        );
        Self {
            coordinator,
            config,
            identity,
            keys,
            started_at: Instant::now(),
            closing: Arc::new(AtomicBool::new(false)),
            presence_task: Mutex::new(None),
            health_task: Mutex::new(None),
            events,
        }
    }

    /// This instance's identity.
    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    fn service_presence_json(&self) -> Result<String, PresenceError> {
        let presence = ServicePresence {
            service_name: self.config.normalized_service_name(),
            service_description: self.config.service_description.clone(),
            version: self.config.service_version.clone(),
            instance_id: self.identity.instance_id.clone(),
            updated_on: chrono::Utc::now().to_rfc3339(),
            process_id: self.identity.process_id,
            ip: self.config.advertised_host().to_string(),
            port: self.config.service_port,
            host_name: self.identity.host_name.clone(),
        };
        serde_json::to_string(&presence)
            .map_err(|e| PresenceError::Coordinator(crate::error::CoordinatorError::Decode(e.to_string())))
    }

    fn health_snapshot_json(&self) -> Result<String, PresenceError> {
        let health = ServiceHealth {
            service_name: self.config.normalized_service_name(),
            instance_id: self.identity.instance_id.clone(),
            host_name: self.identity.host_name.clone(),
            sampled_on: chrono::Utc::now().to_rfc3339(),
            process_id: self.identity.process_id,
            architecture: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            version: self.config.service_version.clone(),
            memory: MemorySnapshot::default(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        };
        serde_json::to_string(&health)
            .map_err(|e| PresenceError::Coordinator(crate::error::CoordinatorError::Decode(e.to_string())))
    }

    /// One presence tick: `SETEX presence TTL instanceID` and
    /// `HSET nodes instanceID <json>`, issued as a single atomic batch.
    pub async fn presence_tick(&self) -> Result<(), PresenceError> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let presence_json = self.service_presence_json()?;
        self.coordinator
            .atomic(vec![
                CoordinatorOp::SetEx {
                    key: self.keys.presence.clone(),
                    ttl_secs: KEY_EXPIRATION_TTL,
                    value: self.identity.instance_id.clone(),
                },
                CoordinatorOp::HSet {
                    key: self.keys.nodes.clone(),
                    field: self.identity.instance_id.clone(),
                    value: presence_json,
                },
            ])
            .await?;
        #[cfg(feature = "otel")]
        tracing::debug!(
            service = %self.config.normalized_service_name(),
            instance_id = %self.identity.instance_id,
            "presence tick"
        );
        Ok(())
    }

    /// One health tick: `SETEX health TTL <json>` and
    /// `EXPIRE health-log ONE_WEEK`.
    pub async fn health_tick(&self) -> Result<(), PresenceError> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let health_json = self.health_snapshot_json()?;
        self.coordinator
            .atomic(vec![
                CoordinatorOp::SetEx {
                    key: self.keys.health.clone(),
                    ttl_secs: KEY_EXPIRATION_TTL,
                    value: health_json,
                },
                CoordinatorOp::Expire {
                    key: self.keys.health_log.clone(),
                    ttl_secs: HEALTH_LOG_TTL,
                },
            ])
            .await?;
        #[cfg(feature = "otel")]
        tracing::debug!(
            service = %self.config.normalized_service_name(),
            instance_id = %self.identity.instance_id,
            "health tick"
        );
        Ok(())
    }

    /// Appends an entry to the capped health log, suppressing entries that
    /// mention the coordinator itself (avoids a feedback loop when the
    /// coordinator is the failing component).
    pub async fn log(&self, entry_type: &str, msg: impl Into<String>) {
        let msg = msg.into();
        if msg.to_lowercase().contains("redis") {
            return;
        }
        let entry = HealthLogEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            service_name: self.config.normalized_service_name(),
            entry_type: entry_type.to_string(),
            process_id: self.identity.process_id,
            msg: msg.clone(),
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = self.coordinator.lpush(&self.keys.health_log, &json).await;
            let _ = self
                .coordinator
                .ltrim(
                    &self.keys.health_log,
                    0,
                    crate::config::MAX_ENTRIES_IN_HEALTH_LOG as i64 - 1,
                )
                .await;
        }
        let _ = self.events.send(FabricEvent::Log {
            ts: entry.ts,
            service_name: entry.service_name,
            entry_type: entry.entry_type,
            process_id: entry.process_id,
            msg,
        });
    }

    /// Registers this instance: writes the Service Record, performs one
    /// immediate presence tick, and starts the presence/health timers.
    ///
    /// Subscribing to the inbound channels (§4.4) and starting the route
    /// broadcast are the caller's job (the facade wires presence, bus, and
    /// routes together); this method covers only the presence/health half
    /// of registration.
    pub async fn register_service(&self) -> Result<Registration, PresenceError> {
        if self.config.service_name.is_empty() {
            return Err(PresenceError::NotInitialized);
        }

        let record = ServiceRecord {
            service_name: self.config.normalized_service_name(),
            service_type: self.config.service_type.clone(),
            registered_on: chrono::Utc::now().to_rfc3339(),
        };
        let record_json = serde_json::to_string(&record)
            .map_err(|e| PresenceError::Coordinator(crate::error::CoordinatorError::Decode(e.to_string())))?;
        self.coordinator
            .set(&self.keys.service_record, &record_json)
            .await?;

        // Immediate tick so the first lookup after register succeeds.
        self.presence_tick().await?;
        self.health_tick().await?;

        self.start_timers();

        #[cfg(feature = "otel")]
        tracing::info!(
            service = %self.config.normalized_service_name(),
            instance_id = %self.identity.instance_id,
            "service registered"
        );

        Ok(Registration {
            service_name: self.config.normalized_service_name(),
            service_ip: self.config.advertised_host().to_string(),
            service_port: self.config.service_port,
        })
    }

    fn start_timers(&self) {
        let closing = Arc::clone(&self.closing);
        let coordinator = Arc::clone(&self.coordinator);
        let keys_presence = self.keys.presence.clone();
        let keys_nodes = self.keys.nodes.clone();
        let instance_id = self.identity.instance_id.clone();
        let presence_json_fn = {
            let config = self.config.clone();
            let identity = self.identity.clone();
            move || -> String {
                let presence = ServicePresence {
                    service_name: config.normalized_service_name(),
                    service_description: config.service_description.clone(),
                    version: config.service_version.clone(),
                    instance_id: identity.instance_id.clone(),
                    updated_on: chrono::Utc::now().to_rfc3339(),
                    process_id: identity.process_id,
                    ip: config.advertised_host().to_string(),
                    port: config.service_port,
                    host_name: identity.host_name.clone(),
                };
                serde_json::to_string(&presence).unwrap_or_default()
            }
        };

        let presence_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                PRESENCE_UPDATE_INTERVAL,
            ));
            interval.tick().await; // first tick fires immediately; already done above
            loop {
                interval.tick().await;
                if closing.load(Ordering::SeqCst) {
                    continue;
                }
                let _ = coordinator
                    .atomic(vec![
                        CoordinatorOp::SetEx {
                            key: keys_presence.clone(),
                            ttl_secs: KEY_EXPIRATION_TTL,
                            value: instance_id.clone(),
                        },
                        CoordinatorOp::HSet {
                            key: keys_nodes.clone(),
                            field: instance_id.clone(),
                            value: presence_json_fn(),
                        },
                    ])
                    .await;
                #[cfg(feature = "otel")]
                tracing::debug!(instance_id = %instance_id, "presence timer tick");
            }
        });

        let closing2 = Arc::clone(&self.closing);
        let coordinator2 = Arc::clone(&self.coordinator);
        let keys_health = self.keys.health.clone();
        let keys_health_log = self.keys.health_log.clone();
        let config2 = self.config.clone();
        let identity2 = self.identity.clone();
        let started_at = self.started_at;

        let health_handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(HEALTH_UPDATE_INTERVAL));
            interval.tick().await;
            loop {
                interval.tick().await;
                if closing2.load(Ordering::SeqCst) {
                    continue;
                }
                let health = ServiceHealth {
                    service_name: config2.normalized_service_name(),
                    instance_id: identity2.instance_id.clone(),
                    host_name: identity2.host_name.clone(),
                    sampled_on: chrono::Utc::now().to_rfc3339(),
                    process_id: identity2.process_id,
                    architecture: std::env::consts::ARCH.to_string(),
                    platform: std::env::consts::OS.to_string(),
                    version: config2.service_version.clone(),
                    memory: MemorySnapshot::default(),
                    uptime_seconds: started_at.elapsed().as_secs(),
                };
                let Ok(json) = serde_json::to_string(&health) else {
                    continue;
                };
                let _ = coordinator2
                    .atomic(vec![
                        CoordinatorOp::SetEx {
                            key: keys_health.clone(),
                            ttl_secs: KEY_EXPIRATION_TTL,
                            value: json,
                        },
                        CoordinatorOp::Expire {
                            key: keys_health_log.clone(),
                            ttl_secs: HEALTH_LOG_TTL,
                        },
                    ])
                    .await;
                #[cfg(feature = "otel")]
                tracing::debug!(instance_id = %identity2.instance_id, "health timer tick");
            }
        });

        // Storing the handles is best-effort; if a prior call already
        // started timers this just replaces the stored handle (the old
        // task keeps running harmlessly until the process exits, since
        // `register_service` is documented as single-call-per-instance).
        if let Ok(mut guard) = self.presence_task.try_lock() {
            *guard = Some(presence_handle);
        }
        if let Ok(mut guard) = self.health_task.try_lock() {
            *guard = Some(health_handle);
        }
    }

    /// Idempotent shutdown: stops timers, shortens the health keys to a
    /// near-term expiry, deletes the presence key. Resolves even if
    /// individual coordinator calls fail.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return; // already shut down
        }

        if let Some(handle) = self.presence_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }

        const NEAR_TERM_TTL: u64 = 2;
        let _ = self
            .coordinator
            .expire(&self.keys.health, NEAR_TERM_TTL)
            .await;
        let _ = self
            .coordinator
            .expire(&self.keys.health_log, NEAR_TERM_TTL)
            .await;
        let _ = self.coordinator.del(&self.keys.presence).await;
        let _ = self.coordinator.close().await;

        #[cfg(feature = "otel")]
        tracing::info!(
            service = %self.config.normalized_service_name(),
            instance_id = %self.identity.instance_id,
            "presence engine shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;

    fn test_config() -> FabricConfig {
        let mut config = FabricConfig::new("test-service").unwrap();
        config.service_port = 5000;
        config.service_ip = "127.0.0.1".to_string();
        config.service_type = "test".to_string();
        config
    }

    #[tokio::test]
    async fn register_service_writes_service_record_and_presence() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let (tx, _rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(&coordinator), test_config(), tx);

        let registration = engine.register_service().await.unwrap();
        assert_eq!(registration.service_name, "test-service");

        let record_json = coordinator
            .get("hydra:service:test-service:service")
            .await
            .unwrap()
            .expect("service record written");
        let record: ServiceRecord = serde_json::from_str(&record_json).unwrap();
        assert_eq!(record.service_type, "test");

        let presence = coordinator
            .get(&format!(
                "hydra:service:test-service:{}:presence",
                engine.identity().instance_id
            ))
            .await
            .unwrap();
        assert_eq!(presence, Some(engine.identity().instance_id.clone()));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn presence_refresh_updates_timestamp() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let (tx, _rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(&coordinator), test_config(), tx);
        engine.register_service().await.unwrap();

        let first = coordinator
            .hget("hydra:service:nodes", &engine.identity().instance_id)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.presence_tick().await.unwrap();
        let second = coordinator
            .hget("hydra:service:nodes", &engine.identity().instance_id)
            .await
            .unwrap()
            .unwrap();

        let r1: ServicePresence = serde_json::from_str(&first).unwrap();
        let r2: ServicePresence = serde_json::from_str(&second).unwrap();
        assert_ne!(r1.updated_on, r2.updated_on);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_deletes_presence_key() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let (tx, _rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(&coordinator), test_config(), tx);
        engine.register_service().await.unwrap();

        engine.shutdown().await;
        engine.shutdown().await; // must not panic or double-abort

        let presence = coordinator
            .get(&format!(
                "hydra:service:test-service:{}:presence",
                engine.identity().instance_id
            ))
            .await
            .unwrap();
        assert_eq!(presence, None);
    }

    #[tokio::test]
    async fn log_suppresses_entries_mentioning_coordinator() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let (tx, mut rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(&coordinator), test_config(), tx);

        engine.log("error", "redis connection refused").await;
        assert!(rx.try_recv().is_err());

        engine.log("info", "started successfully").await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, FabricEvent::Log { .. }));
    }
}
