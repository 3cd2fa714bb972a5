//! Message bus: per-service and per-instance pub/sub channels, a pooled
//! publisher keyed by channel hash, and reply/broadcast helpers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::coordinator::Coordinator;
use crate::discovery::Discovery;
use crate::error::{BusError, DiscoveryError};
use crate::facade::FabricEvent;
use crate::umf::{parse_route, UmfMessage};
use crate::util::string_hash;

/// The fabric's reserved router service name; `sendBroadcastMessage`
/// against it with no live instances succeeds silently (routers are
/// optional collaborators).
const ROUTER_SERVICE_NAME: &str = "hydra-router";

/// The outcome of a send that resolved without an error but may not have
/// reached anyone. Mirrors the contract's "resolve with a 503-shaped
/// response, never reject" rule for unavailability.
#[derive(Debug, Clone, PartialEq)]
pub enum BusSendOutcome {
    /// The message was published to a live channel.
    Sent,
    /// No live instance of the target service could be found.
    Unavailable {
        /// Synthetic HTTP-shaped status code, always 503.
        status_code: u16,
        /// Human-readable explanation.
        message: String,
    },
}

impl BusSendOutcome {
    fn unavailable(service_name: &str) -> Self {
        Self::Unavailable {
            status_code: 503,
            message: format!("Unavailable {service_name} instances"),
        }
    }

    /// `true` for [`BusSendOutcome::Sent`].
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

fn discovery_err(err: DiscoveryError) -> BusError {
    match err {
        DiscoveryError::Coordinator(c) => BusError::Coordinator(c),
        DiscoveryError::NotFound(name) => BusError::RouteParse(name),
    }
}

/// Subscribes to inbound channels, publishes outbound messages through a
/// pooled set of coordinator connections, and routes replies/broadcasts.
pub struct MessageBus {
    coordinator: Arc<dyn Coordinator>,
    discovery: Arc<Discovery>,
    key_prefix: String,
    service_name: String,
    instance_id: String,
    events: broadcast::Sender<FabricEvent>,
    publishers: RwLock<HashMap<u32, Arc<dyn Coordinator>>>,
    inbound_tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Builds a bus for `service_name`/`instance_id`, sharing `discovery`
    /// for roster lookups.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        discovery: Arc<Discovery>,
        key_prefix: impl Into<String>,
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        events: broadcast::Sender<FabricEvent>,
    ) -> Self {
        Self {
            coordinator,
            discovery,
            key_prefix: key_prefix.into(),
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            events,
            publishers: RwLock::new(HashMap::new()),
            inbound_tasks: RwLock::new(Vec::new()),
        }
    }

    fn service_channel(&self, service: &str) -> String {
        format!("{}:mc:{}", self.key_prefix, service)
    }

    fn direct_channel(&self, service: &str, instance_id: &str) -> String {
        format!("{}:mc:{}:{}", self.key_prefix, service, instance_id)
    }

    /// Opens the two inbound subscriptions for this instance (service-wide
    /// and direct) and spawns tasks that decode each payload as UMF and
    /// emit it as a [`FabricEvent::Message`].
    pub async fn subscribe_inbound(&self) -> Result<(), BusError> {
        let service_channel = self.service_channel(&self.service_name);
        let direct_channel = self.direct_channel(&self.service_name, &self.instance_id);

        let service_sub = self.coordinator.subscribe(&service_channel).await?;
        let direct_sub = self.coordinator.subscribe(&direct_channel).await?;

        let mut tasks = self.inbound_tasks.write();
        tasks.push(spawn_inbound_forwarder(service_sub, self.events.clone()));
        tasks.push(spawn_inbound_forwarder(direct_sub, self.events.clone()));
        Ok(())
    }

    /// Closes the inbound subscriptions and the publisher pool.
    pub fn shutdown(&self) {
        for task in self.inbound_tasks.write().drain(..) {
            task.abort();
        }
        self.publishers.write().clear();
    }

    async fn publisher_for(&self, channel: &str) -> Arc<dyn Coordinator> {
        let key = string_hash(channel);
        if let Some(existing) = self.publishers.read().get(&key).cloned() {
            return existing;
        }
        let handle = self.coordinator.duplicate();
        self.publishers.write().insert(key, Arc::clone(&handle));
        handle
    }

    async fn publish(&self, channel: &str, msg: &UmfMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(&msg.to_short_json())
            .map_err(|e| BusError::Encode(e.to_string()))?;
        let publisher = self.publisher_for(channel).await;
        publisher.publish(channel, &payload).await?;
        Ok(())
    }

    /// Validates and routes `msg` to its pinned instance if one is named
    /// and live, otherwise to the first (already shuffled) instance in the
    /// resolved roster.
    pub async fn send_message(&self, msg: &UmfMessage) -> Result<BusSendOutcome, BusError> {
        if !msg.validate() {
            return Err(BusError::InvalidMessage);
        }
        let parsed = parse_route(&msg.to);
        if !parsed.error.is_empty() {
            return Err(BusError::RouteParse(parsed.error));
        }

        let instances = self
            .discovery
            .get_service_presence(&parsed.service_name)
            .await
            .map_err(discovery_err)?;
        if instances.is_empty() {
            return Ok(BusSendOutcome::unavailable(&parsed.service_name));
        }

        let target_instance_id = parsed
            .instance
            .as_deref()
            .and_then(|pinned| {
                instances
                    .iter()
                    .find(|entry| entry.presence.instance_id == pinned)
                    .map(|entry| entry.presence.instance_id.clone())
            })
            .unwrap_or_else(|| instances[0].presence.instance_id.clone());

        let channel = self.direct_channel(&parsed.service_name, &target_instance_id);
        self.publish(&channel, msg).await?;
        Ok(BusSendOutcome::Sent)
    }

    /// Publishes to the service-wide channel. A broadcast to the reserved
    /// router service with no live instances succeeds silently.
    pub async fn send_broadcast_message(&self, msg: &UmfMessage) -> Result<BusSendOutcome, BusError> {
        if !msg.validate() {
            return Err(BusError::InvalidMessage);
        }
        let parsed = parse_route(&msg.to);
        if !parsed.error.is_empty() {
            return Err(BusError::RouteParse(parsed.error));
        }

        let instances = self
            .discovery
            .get_service_presence(&parsed.service_name)
            .await
            .map_err(discovery_err)?;
        if instances.is_empty() {
            if parsed.service_name == ROUTER_SERVICE_NAME {
                return Ok(BusSendOutcome::Sent);
            }
            return Ok(BusSendOutcome::unavailable(&parsed.service_name));
        }

        let channel = self.service_channel(&parsed.service_name);
        self.publish(&channel, msg).await?;
        Ok(BusSendOutcome::Sent)
    }

    /// Builds the reply envelope (swap `to`/`from`, set `rmid`, honor
    /// `via`/`forward`) and sends it as a direct message.
    pub async fn send_reply_message(
        &self,
        original: &UmfMessage,
        response_body: serde_json::Value,
    ) -> Result<BusSendOutcome, BusError> {
        let reply = original.reply_envelope(response_body);
        self.send_message(&reply).await
    }
}

fn spawn_inbound_forwarder(
    mut sub: crate::coordinator::Subscription,
    events: broadcast::Sender<FabricEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((_channel, payload)) = sub.recv().await {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) else {
                continue;
            };
            let Ok(msg) = UmfMessage::from_json(&value) else {
                continue;
            };
            let _ = events.send(FabricEvent::Message(msg.to_short_json()));
        }
    })
}
