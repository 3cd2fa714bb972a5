//! Durable queue engine: enqueue, atomic claim, and completion bookkeeping
//! over three ordered lists per service.

use std::sync::Arc;

use crate::coordinator::Coordinator;
use crate::error::QueueError;
use crate::umf::UmfMessage;

const DEFAULT_INCOMPLETE_REASON: &str = "reason not provided";

/// Enqueues and claims UMF messages through the coordinator's list
/// primitives; at-least-once, no reaper for orphaned in-progress claims
/// (a crashed consumer leaves its claim in `mqinprogress` indefinitely).
pub struct Queue {
    coordinator: Arc<dyn Coordinator>,
    key_prefix: String,
}

impl Queue {
    /// Builds a queue client under `key_prefix`.
    pub fn new(coordinator: Arc<dyn Coordinator>, key_prefix: impl Into<String>) -> Self {
        Self {
            coordinator,
            key_prefix: key_prefix.into(),
        }
    }

    fn recieved_key(&self, service: &str) -> String {
        format!("{}:{}:mqrecieved", self.key_prefix, service)
    }

    fn in_progress_key(&self, service: &str) -> String {
        format!("{}:{}:mqinprogress", self.key_prefix, service)
    }

    fn incomplete_key(&self, service: &str) -> String {
        format!("{}:{}:mqincomplete", self.key_prefix, service)
    }

    /// Validates `msg` and left-pushes its short form onto the inbox.
    pub async fn queue_message(&self, service: &str, msg: &UmfMessage) -> Result<(), QueueError> {
        if !msg.validate() {
            return Err(QueueError::InvalidMessage);
        }
        let payload = serde_json::to_string(&msg.to_short_json())
            .map_err(|e| QueueError::Codec(e.to_string()))?;
        self.coordinator
            .lpush(&self.recieved_key(service), &payload)
            .await?;
        Ok(())
    }

    /// Atomically moves the tail of the inbox to the head of the
    /// in-progress list, decoding it as UMF. Returns `None` if the inbox is
    /// empty.
    pub async fn get_queued_message(
        &self,
        service: &str,
    ) -> Result<Option<UmfMessage>, QueueError> {
        let moved = self
            .coordinator
            .rpoplpush(&self.recieved_key(service), &self.in_progress_key(service))
            .await?;
        let Some(raw) = moved else {
            return Ok(None);
        };
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| QueueError::Codec(e.to_string()))?;
        let msg = UmfMessage::from_json(&value).map_err(QueueError::Codec)?;
        Ok(Some(msg))
    }

    /// Removes `msg` from the in-progress list. If `completed` is false,
    /// annotates the body with a `reason` (falling back to
    /// `"reason not provided"`) and pushes the annotated copy onto the
    /// incomplete list.
    pub async fn mark_queue_message(
        &self,
        service: &str,
        msg: &UmfMessage,
        completed: bool,
        reason: Option<&str>,
    ) -> Result<(), QueueError> {
        let short = msg.to_short_json();
        let encoded =
            serde_json::to_string(&short).map_err(|e| QueueError::Codec(e.to_string()))?;
        self.coordinator
            .lrem(&self.in_progress_key(service), -1, &encoded)
            .await?;

        if completed {
            return Ok(());
        }

        let mut annotated = msg.clone();
        let reason = reason.unwrap_or(DEFAULT_INCOMPLETE_REASON).to_string();
        match annotated.body.as_object_mut() {
            Some(obj) => {
                obj.insert("reason".to_string(), serde_json::Value::String(reason));
            }
            None => {
                annotated.body = serde_json::json!({ "reason": reason });
            }
        }
        let encoded = serde_json::to_string(&annotated.to_short_json())
            .map_err(|e| QueueError::Codec(e.to_string()))?;
        self.coordinator
            .rpush(&self.incomplete_key(service), &encoded)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use serde_json::json;

    fn test_queue() -> (Queue, Arc<dyn Coordinator>) {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        (Queue::new(Arc::clone(&coordinator), "hydra:service"), coordinator)
    }

    #[tokio::test]
    async fn queue_then_claim_round_trips_message() {
        let (queue, _coord) = test_queue();
        let msg = UmfMessage::new("orders:[get]/x", "client", json!({"id": 1}));
        queue.queue_message("orders", &msg).await.unwrap();

        let claimed = queue.get_queued_message("orders").await.unwrap().unwrap();
        assert_eq!(claimed.to, msg.to);
        assert_eq!(claimed.from, msg.from);
        assert_eq!(claimed.body, msg.body);
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let (queue, _coord) = test_queue();
        assert!(queue.get_queued_message("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_completed_removes_from_in_progress_without_incomplete_entry() {
        let (queue, coordinator) = test_queue();
        let msg = UmfMessage::new("orders:[get]/x", "client", json!({}));
        queue.queue_message("orders", &msg).await.unwrap();
        let claimed = queue.get_queued_message("orders").await.unwrap().unwrap();

        queue
            .mark_queue_message("orders", &claimed, true, None)
            .await
            .unwrap();

        assert!(coordinator
            .lrange("hydra:service:orders:mqinprogress", 0, -1)
            .await
            .unwrap()
            .is_empty());
        assert!(coordinator
            .lrange("hydra:service:orders:mqincomplete", 0, -1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mark_incomplete_annotates_reason_and_moves_to_incomplete() {
        let (queue, coordinator) = test_queue();
        let msg = UmfMessage::new("orders:[get]/x", "client", json!({}));
        queue.queue_message("orders", &msg).await.unwrap();
        let claimed = queue.get_queued_message("orders").await.unwrap().unwrap();

        queue
            .mark_queue_message("orders", &claimed, false, Some("x"))
            .await
            .unwrap();

        let incomplete = coordinator
            .lrange("hydra:service:orders:mqincomplete", 0, -1)
            .await
            .unwrap();
        assert_eq!(incomplete.len(), 1);
        assert!(incomplete[0].contains("\"reason\":\"x\""));

        assert!(coordinator
            .lrange("hydra:service:orders:mqinprogress", 0, -1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mark_incomplete_defaults_reason_when_absent() {
        let (queue, coordinator) = test_queue();
        let msg = UmfMessage::new("orders:[get]/x", "client", json!({}));
        queue.queue_message("orders", &msg).await.unwrap();
        let claimed = queue.get_queued_message("orders").await.unwrap().unwrap();

        queue
            .mark_queue_message("orders", &claimed, false, None)
            .await
            .unwrap();

        let incomplete = coordinator
            .lrange("hydra:service:orders:mqincomplete", 0, -1)
            .await
            .unwrap();
        assert!(incomplete[0].contains("reason not provided"));
    }
}
