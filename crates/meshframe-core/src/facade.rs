//! The fabric facade: the single public surface gluing presence, discovery,
//! routing, the message bus, queues, and HTTP dispatch together, with
//! serial plugin lifecycle hooks wrapped around registration.
//!
//! [`Fabric`] is a cheap-clone handle (an `Arc` around its shared state),
//! the same shape `reqwest::Client` and similar facades take — plugins and
//! application code can hold their own clone without fighting the borrow
//! checker, and every clone observes the same presence ticks, cache, and
//! publisher pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::bus::{BusSendOutcome, MessageBus};
use crate::config::FabricConfig;
use crate::coordinator::{Coordinator, MemoryCoordinator};
use crate::discovery::{Discovery, NodeEntry, ServiceHealthAll, ServiceInstance};
use crate::dispatch::{DispatchResponse, Dispatcher, SendOptions};
pub use crate::error::FabricError;
use crate::plugin::{Plugin, PluginHost};
use crate::presence::{
    HealthLogEntry, InstanceIdentity, PresenceEngine, Registration, ServiceHealth, ServiceRecord,
};
use crate::queue::Queue;
use crate::routes::{RouteRegistry, ROUTER_SERVICE_NAME};
use crate::umf::{ServiceRouteMap, UmfMessage};

/// Capacity of the broadcast channel every [`FabricEvent`] subscriber reads
/// from. A slow subscriber that falls this far behind starts missing
/// events rather than backpressuring ticks and dispatch.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events the facade emits: structured log lines, inbound bus messages
/// (short wire form), and dispatch/bus failure metrics.
#[derive(Debug, Clone)]
pub enum FabricEvent {
    /// A health-log-style line, also appended to the coordinator's capped
    /// health log unless it mentions the coordinator itself.
    Log {
        /// ISO-8601 timestamp.
        ts: String,
        /// Lower-cased service name.
        service_name: String,
        /// Free-form level/type (`"info"`, `"error"`, …).
        entry_type: String,
        /// OS process ID.
        process_id: u32,
        /// Log message text.
        msg: String,
    },
    /// An inbound message received on this instance's service-wide or
    /// direct channel, in short wire form.
    Message(Value),
    /// A free-form metric string, emitted on dispatch failover and
    /// exhaustion.
    Metric(String),
}

struct FabricInner {
    config: FabricConfig,
    coordinator: Arc<dyn Coordinator>,
    identity: InstanceIdentity,
    presence: PresenceEngine,
    discovery: Arc<Discovery>,
    routes: RouteRegistry,
    bus: MessageBus,
    queue: Queue,
    dispatcher: Dispatcher,
    plugin_host: PluginHost,
    events: broadcast::Sender<FabricEvent>,
    registered: AtomicBool,
    startup_routes: Vec<String>,
}

/// The fabric facade. Cheap to clone; every clone shares the same
/// coordinator handle, presence engine, caches, and publisher pool.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Fabric {
    /// Starts building a fabric for `service_name`, with default
    /// configuration until [`FabricBuilder::config`] overrides it.
    pub fn builder(service_name: &str) -> FabricBuilder {
        FabricBuilder::new(service_name)
    }

    /// The loaded configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    /// This instance's identity.
    pub fn identity(&self) -> &InstanceIdentity {
        &self.inner.identity
    }

    /// The shared coordinator handle, for collaborators (e.g. a plugin)
    /// that need direct access beyond the facade's own operations.
    pub fn coordinator(&self) -> Arc<dyn Coordinator> {
        Arc::clone(&self.inner.coordinator)
    }

    /// `true` once [`Fabric::start`] has completed registration.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Subscribes to `log`/`message`/`metric` events. Each clone of the
    /// facade shares the same underlying broadcast sender, so a subscriber
    /// started before or after [`Fabric::start`] sees the same stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.inner.events.subscribe()
    }

    /// Registers this instance: runs `set_hydra` on every plugin, writes
    /// the Service Record, performs the immediate presence/health tick and
    /// starts their timers, subscribes the two inbound bus channels,
    /// publishes any builder-configured routes (broadcasting a refresh
    /// notice unless this service is the router itself), then runs the
    /// plugin `init` sequence (`set_config`, serially, then
    /// `on_service_ready`, serially).
    pub async fn start(&self) -> Result<Registration, FabricError> {
        self.inner.plugin_host.use_plugins(self.clone()).await;

        let registration = self.inner.presence.register_service().await?;
        self.inner.bus.subscribe_inbound().await?;

        if !self.inner.startup_routes.is_empty() {
            self.register_routes(&self.inner.startup_routes).await?;
        }

        self.inner.plugin_host.set_config(&self.inner.config.plugins).await;
        self.inner.plugin_host.on_service_ready().await;

        self.inner.registered.store(true, Ordering::SeqCst);
        #[cfg(feature = "otel")]
        tracing::info!(
            service = %self.inner.config.normalized_service_name(),
            "fabric started"
        );
        Ok(registration)
    }

    /// Idempotent shutdown: stops the presence/health timers, shortens the
    /// health keys, deletes the presence key, and closes the bus's inbound
    /// subscriptions and publisher pool. Resolves even if individual steps
    /// fail.
    pub async fn shutdown(&self) -> Result<(), FabricError> {
        self.inner.presence.shutdown().await;
        self.inner.bus.shutdown();
        self.inner.registered.store(false, Ordering::SeqCst);
        #[cfg(feature = "otel")]
        tracing::info!(
            service = %self.inner.config.normalized_service_name(),
            "fabric shut down"
        );
        Ok(())
    }

    // ---- Discovery ---------------------------------------------------

    /// All registered services.
    pub async fn get_services(&self) -> Result<Vec<ServiceRecord>, FabricError> {
        Ok(self.inner.discovery.get_services().await?)
    }

    /// The entire nodes directory, decorated with elapsed time.
    pub async fn get_service_nodes(&self) -> Result<Vec<NodeEntry>, FabricError> {
        Ok(self.inner.discovery.get_service_nodes().await?)
    }

    /// The Service Record for `name`.
    pub async fn find_service(&self, name: &str) -> Result<ServiceRecord, FabricError> {
        Ok(self.inner.discovery.find_service(name).await?)
    }

    /// The live, shuffled roster for `name`.
    pub async fn get_service_presence(&self, name: &str) -> Result<Vec<ServiceInstance>, FabricError> {
        Ok(self.inner.discovery.get_service_presence(name).await?)
    }

    /// `true` iff at least one live instance of `name` exists.
    pub async fn has_service_presence(&self, name: &str) -> Result<bool, FabricError> {
        Ok(self.inner.discovery.has_service_presence(name).await?)
    }

    /// Live health snapshots for `name`.
    pub async fn get_service_health(&self, name: &str) -> Result<Vec<ServiceHealth>, FabricError> {
        Ok(self.inner.discovery.get_service_health(name).await?)
    }

    /// The health log, newest first, for every live instance of `name`.
    pub async fn get_service_health_log(&self, name: &str) -> Result<Vec<HealthLogEntry>, FabricError> {
        Ok(self.inner.discovery.get_service_health_log(name).await?)
    }

    /// Fans `get_services`/`get_service_nodes`/`get_service_health` out
    /// across every known service.
    pub async fn get_service_health_all(&self) -> Result<ServiceHealthAll, FabricError> {
        Ok(self.inner.discovery.get_service_health_all().await?)
    }

    /// Reads the Config Store entry for `service` under version `label`.
    pub async fn get_config(&self, service: &str, label: &str) -> Result<Option<Value>, FabricError> {
        Ok(self.inner.discovery.get_config(service, label).await?)
    }

    /// Writes a Config Store entry for `service` under version `label`.
    pub async fn put_config(&self, service: &str, label: &str, config: &Value) -> Result<(), FabricError> {
        Ok(self.inner.discovery.put_config(service, label, config).await?)
    }

    /// Every Config Store version label for `service`, sorted.
    pub async fn list_config(&self, service: &str) -> Result<Vec<String>, FabricError> {
        Ok(self.inner.discovery.list_config(service).await?)
    }

    // ---- Route registry ------------------------------------------------

    /// Atomically replaces this instance's published routes (plus the
    /// three self-routes) and broadcasts a refresh notice to
    /// `hydra-router:/refresh`, unless this service is the router itself.
    pub async fn register_routes(&self, routes: &[String]) -> Result<(), FabricError> {
        let should_broadcast = self.inner.routes.register_routes(routes).await?;
        if should_broadcast {
            let refresh = UmfMessage::new(
                format!("{}:/refresh", ROUTER_SERVICE_NAME),
                self.inner.config.normalized_service_name(),
                serde_json::json!({}),
            );
            // A missing router is not an error: routers are optional.
            let _ = self.inner.bus.send_broadcast_message(&refresh).await;
        }
        Ok(())
    }

    /// Every service's published routes, keyed by service name.
    pub async fn get_all_service_routes(&self) -> Result<ServiceRouteMap, FabricError> {
        Ok(self.inner.routes.get_all_service_routes().await?)
    }

    /// `true` iff this instance's compiled routes accept `path`.
    pub fn match_route(&self, method: Option<&str>, path: &str) -> bool {
        self.inner.routes.match_route(method, path)
    }

    // ---- Message bus ----------------------------------------------------

    /// Sends `msg` to its pinned instance if named and live, otherwise to a
    /// random live instance.
    pub async fn send_message(&self, msg: &UmfMessage) -> Result<BusSendOutcome, FabricError> {
        Ok(self.inner.bus.send_message(msg).await?)
    }

    /// Publishes `msg` to the target service's broadcast channel.
    pub async fn send_broadcast_message(&self, msg: &UmfMessage) -> Result<BusSendOutcome, FabricError> {
        Ok(self.inner.bus.send_broadcast_message(msg).await?)
    }

    /// Builds and sends a reply envelope for `original`.
    pub async fn send_reply_message(
        &self,
        original: &UmfMessage,
        response_body: Value,
    ) -> Result<BusSendOutcome, FabricError> {
        Ok(self.inner.bus.send_reply_message(original, response_body).await?)
    }

    // ---- Queue engine ----------------------------------------------------

    /// Enqueues `msg` onto `service`'s inbox.
    pub async fn queue_message(&self, service: &str, msg: &UmfMessage) -> Result<(), FabricError> {
        Ok(self.inner.queue.queue_message(service, msg).await?)
    }

    /// Atomically claims the next queued message for `service`.
    pub async fn get_queued_message(&self, service: &str) -> Result<Option<UmfMessage>, FabricError> {
        Ok(self.inner.queue.get_queued_message(service).await?)
    }

    /// Marks a claimed message complete or incomplete.
    pub async fn mark_queue_message(
        &self,
        service: &str,
        msg: &UmfMessage,
        completed: bool,
        reason: Option<&str>,
    ) -> Result<(), FabricError> {
        Ok(self.inner.queue.mark_queue_message(service, msg, completed, reason).await?)
    }

    // ---- HTTP dispatch ----------------------------------------------------

    /// Parses `msg`'s route, resolves a live instance, and issues the
    /// request, failing over across instances. Unavailability and
    /// validation failures resolve as a synthetic HTTP-shaped response
    /// rather than an `Err`.
    pub async fn make_api_request(
        &self,
        msg: &UmfMessage,
        send_opts: Option<SendOptions>,
    ) -> Result<DispatchResponse, FabricError> {
        Ok(self.inner.dispatcher.make_api_request(msg, send_opts).await?)
    }

    // ---- Plugin host ----------------------------------------------------

    /// Runs the plugin `configUpdate` sequence: `update_config` on every
    /// plugin, serially, followed by `config_changed` for any plugin whose
    /// options changed from their previous call.
    pub async fn config_update(&self, opts: Value) {
        self.inner.plugin_host.config_update(opts).await;
    }
}

/// Builds a [`Fabric`], resolving its coordinator connection and
/// registering plugins before the facade exists.
pub struct FabricBuilder {
    config: Result<FabricConfig, FabricError>,
    coordinator: Option<Arc<dyn Coordinator>>,
    plugins: Vec<Arc<dyn Plugin>>,
    routes: Vec<String>,
}

impl FabricBuilder {
    fn new(service_name: &str) -> Self {
        Self {
            config: FabricConfig::new(service_name).map_err(FabricError::from),
            coordinator: None,
            plugins: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Replaces the builder's configuration wholesale, e.g. one loaded via
    /// [`FabricConfig::from_env`].
    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = Ok(config);
        self
    }

    /// Overrides the coordinator handle instead of connecting to
    /// `config.redis_url` — primarily for tests, which want
    /// [`crate::coordinator::MemoryCoordinator`].
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Registers a plugin. `set_hydra` runs on it, in registration order,
    /// when [`Fabric::start`] is called.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Routes to publish on [`Fabric::start`], in addition to the three
    /// self-routes every service gets automatically.
    pub fn routes(mut self, routes: Vec<String>) -> Self {
        self.routes = routes;
        self
    }

    /// Resolves the coordinator (connecting `config.redis_url` with the
    /// Redis backend if none was supplied and that backend is compiled in,
    /// otherwise an in-memory store), constructs every component, and
    /// returns the assembled facade. Plugin `set_hydra` and the core
    /// registration sequence run in [`Fabric::start`], not here — building
    /// a fabric never touches the network beyond the coordinator connect.
    pub async fn build(self) -> Result<Fabric, FabricError> {
        let config = self.config?;

        let coordinator = match self.coordinator {
            Some(coordinator) => coordinator,
            None => Self::connect_coordinator(&config).await?,
        };

        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let presence = PresenceEngine::new(Arc::clone(&coordinator), config.clone(), events.clone());
        let identity = presence.identity().clone();

        let discovery = Arc::new(Discovery::new(Arc::clone(&coordinator), config.key_prefix.clone()));
        let routes = RouteRegistry::new(
            Arc::clone(&coordinator),
            config.key_prefix.clone(),
            config.normalized_service_name(),
        );
        let bus = MessageBus::new(
            Arc::clone(&coordinator),
            Arc::clone(&discovery),
            config.key_prefix.clone(),
            config.normalized_service_name(),
            identity.instance_id.clone(),
            events.clone(),
        );
        let queue = Queue::new(Arc::clone(&coordinator), config.key_prefix.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&discovery), events.clone());

        let mut plugin_host = PluginHost::new();
        for plugin in self.plugins {
            plugin_host.register(plugin);
        }

        let inner = FabricInner {
            config,
            coordinator,
            identity,
            presence,
            discovery,
            routes,
            bus,
            queue,
            dispatcher,
            plugin_host,
            events,
            registered: AtomicBool::new(false),
            startup_routes: self.routes,
        };

        Ok(Fabric { inner: Arc::new(inner) })
    }

    #[cfg(feature = "coordinator-redis")]
    async fn connect_coordinator(config: &FabricConfig) -> Result<Arc<dyn Coordinator>, FabricError> {
        let coordinator = crate::coordinator::RedisCoordinator::connect(&config.redis_url)
            .await
            .map_err(FabricError::from)?;
        Ok(Arc::new(coordinator))
    }

    #[cfg(not(feature = "coordinator-redis"))]
    async fn connect_coordinator(_config: &FabricConfig) -> Result<Arc<dyn Coordinator>, FabricError> {
        Ok(Arc::new(MemoryCoordinator::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use serde_json::json;

    async fn test_fabric(service_name: &str) -> Fabric {
        let mut config = FabricConfig::new(service_name).unwrap();
        config.service_port = 5000;
        config.service_ip = "127.0.0.1".to_string();
        config.service_type = "test".to_string();

        Fabric::builder(service_name)
            .config(config)
            .coordinator(Arc::new(MemoryCoordinator::new()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_registers_service_and_is_idempotent_on_shutdown() {
        let fabric = test_fabric("test-service").await;
        let registration = fabric.start().await.unwrap();
        assert_eq!(registration.service_name, "test-service");
        assert!(fabric.is_registered());

        let record = fabric.find_service("test-service").await.unwrap();
        assert_eq!(record.service_type, "test");

        fabric.shutdown().await.unwrap();
        fabric.shutdown().await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn register_routes_publishes_self_routes_and_matches() {
        let fabric = test_fabric("orders").await;
        fabric.start().await.unwrap();

        fabric
            .register_routes(&["[get]/orders/:id".to_string()])
            .await
            .unwrap();

        assert!(fabric.match_route(Some("get"), "/orders/42"));
        let all = fabric.get_all_service_routes().await.unwrap();
        assert!(all.get("orders").unwrap().contains(&"[get]/orders/:id".to_string()));
    }

    #[tokio::test]
    async fn send_message_to_unknown_service_resolves_unavailable() {
        let fabric = test_fabric("orders").await;
        fabric.start().await.unwrap();

        let msg = UmfMessage::new("billing:[get]/x", "orders", json!({}));
        let outcome = fabric.send_message(&msg).await.unwrap();
        assert!(matches!(outcome, BusSendOutcome::Unavailable { status_code: 503, .. }));
    }

    #[tokio::test]
    async fn make_api_request_against_absent_service_resolves_503() {
        let fabric = test_fabric("orders").await;
        fabric.start().await.unwrap();

        let msg = UmfMessage::new("billing:[get]/x", "orders", json!({}));
        let response = fabric.make_api_request(&msg, None).await.unwrap();
        assert_eq!(response.status_code, 503);
    }

    #[tokio::test]
    async fn queue_round_trips_through_the_facade() {
        let fabric = test_fabric("orders").await;
        fabric.start().await.unwrap();

        let msg = UmfMessage::new("orders:[get]/x", "client", json!({"id": 1}));
        fabric.queue_message("orders", &msg).await.unwrap();
        let claimed = fabric.get_queued_message("orders").await.unwrap().unwrap();
        fabric
            .mark_queue_message("orders", &claimed, false, Some("boom"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn plugin_set_hydra_and_on_service_ready_run_on_start() {
        use crate::plugin::Plugin;
        use async_trait::async_trait;
        use tokio::sync::Mutex as AsyncMutex;

        struct Recorder(Arc<AsyncMutex<Vec<String>>>);

        #[async_trait]
        impl Plugin for Recorder {
            fn name(&self) -> &str {
                "recorder"
            }
            async fn set_hydra(&self, _fabric: Fabric) {
                self.0.lock().await.push("set_hydra".to_string());
            }
            async fn on_service_ready(&self) {
                self.0.lock().await.push("on_service_ready".to_string());
            }
        }

        let calls = Arc::new(AsyncMutex::new(Vec::new()));
        let mut config = FabricConfig::new("orders").unwrap();
        config.service_port = 5000;
        config.service_ip = "127.0.0.1".to_string();

        let fabric = Fabric::builder("orders")
            .config(config)
            .coordinator(Arc::new(MemoryCoordinator::new()))
            .plugin(Arc::new(Recorder(Arc::clone(&calls))))
            .build()
            .await
            .unwrap();

        fabric.start().await.unwrap();

        let recorded = calls.lock().await.clone();
        assert_eq!(recorded, vec!["set_hydra".to_string(), "on_service_ready".to_string()]);
    }

    #[tokio::test]
    async fn config_store_round_trips_through_the_facade() {
        let fabric = test_fabric("orders").await;
        fabric.start().await.unwrap();

        fabric.put_config("orders", "1.0.0", &json!({"k": "v"})).await.unwrap();
        let config = fabric.get_config("orders", "1.0.0").await.unwrap();
        assert_eq!(config, Some(json!({"k": "v"})));
    }
}
