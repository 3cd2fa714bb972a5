//! HTTP dispatch: parsed UMF route → resolved instance → HTTP request, with
//! cross-instance failover and no retry against the same instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::discovery::{Discovery, PresenceEntry};
use crate::error::DispatchError;
use crate::facade::FabricEvent;
use crate::umf::{parse_route, ParsedRoute, UmfMessage};

/// A dispatched request's outcome, shaped to mirror an HTTP response.
/// Unavailability and validation failures resolve into one of these rather
/// than an `Err` — only failures with no sensible HTTP-shaped
/// representation surface as [`DispatchError`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    /// HTTP-ish status code (2xx from a real response, or a synthetic
    /// 400/503 for validation/unavailability).
    pub status_code: u16,
    /// Response headers (only populated for real HTTP responses).
    pub headers: HashMap<String, String>,
    /// The response body: the parsed JSON value for a JSON response, a
    /// plain string for anything else, or a synthetic error object.
    pub body: Value,
}

impl DispatchResponse {
    fn synthetic(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: serde_json::json!({ "error": message.into() }),
        }
    }
}

/// Optional per-call overrides for [`Dispatcher::make_api_request`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides `umfmsg.timeout` for this call only.
    pub timeout_override: Option<Duration>,
}

/// Resolves UMF routes to live instances and issues HTTP requests with
/// cross-instance failover.
pub struct Dispatcher {
    client: Client,
    discovery: Arc<Discovery>,
    events: broadcast::Sender<FabricEvent>,
}

impl Dispatcher {
    /// Builds a dispatcher sharing `discovery` for roster resolution.
    pub fn new(discovery: Arc<Discovery>, events: broadcast::Sender<FabricEvent>) -> Self {
        Self {
            client: Client::new(),
            discovery,
            events,
        }
    }

    fn emit_metric(&self, metric: impl Into<String>) {
        let _ = self.events.send(FabricEvent::Metric(metric.into()));
    }

    /// Validates, parses, and dispatches `msg`. HTTP passthrough (`to`
    /// begins with `http`) bypasses discovery entirely; everything else
    /// resolves via the live roster and enters the failover loop.
    pub async fn make_api_request(
        &self,
        msg: &UmfMessage,
        send_opts: Option<SendOptions>,
    ) -> Result<DispatchResponse, DispatchError> {
        if !msg.validate() {
            return Ok(DispatchResponse::synthetic(
                400,
                "UMF message requires 'to', 'from' and 'body' fields",
            ));
        }

        let parsed = parse_route(&msg.to);
        if !parsed.error.is_empty() {
            return Ok(DispatchResponse::synthetic(400, parsed.error));
        }
        if parsed.http_method.is_none() {
            return Ok(DispatchResponse::synthetic(
                400,
                "HTTP method not specified in `to` field",
            ));
        }
        if parsed.api_route.is_empty() {
            return Ok(DispatchResponse::synthetic(400, "empty API route"));
        }

        if parsed.service_name.starts_with("http") {
            return self.issue_http_passthrough(&parsed, msg, send_opts).await;
        }

        let instances = self
            .discovery
            .get_service_presence(&parsed.service_name)
            .await
            .map_err(|e| DispatchError::RequestBuild(e.to_string()))?;
        if instances.is_empty() {
            self.emit_metric(format!("service:unavailable|{}|no presence", parsed.service_name));
            #[cfg(feature = "otel")]
            tracing::warn!(service = %parsed.service_name, "dispatch attempt found no presence");
            return Ok(DispatchResponse::synthetic(
                503,
                format!("Unavailable {} instances", parsed.service_name),
            ));
        }

        #[cfg(feature = "otel")]
        tracing::debug!(
            service = %parsed.service_name,
            candidates = instances.len(),
            "dispatch attempt"
        );

        self.try_api_request(instances, &parsed, msg, send_opts).await
    }

    async fn issue_http_passthrough(
        &self,
        parsed: &ParsedRoute,
        msg: &UmfMessage,
        send_opts: Option<SendOptions>,
    ) -> Result<DispatchResponse, DispatchError> {
        let method = parsed.http_method.as_deref().unwrap_or("get");
        let url = format!("{}{}", parsed.service_name, parsed.api_route);
        let request = self.build_request(&url, method, msg, send_opts)?;
        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let parsed_json: Value =
                    serde_json::from_str(&text).unwrap_or(Value::String(text));
                Ok(DispatchResponse {
                    status_code: status,
                    headers: HashMap::new(),
                    body: serde_json::json!({ "result": parsed_json }),
                })
            }
            Err(e) => Ok(DispatchResponse::synthetic(502, e.to_string())),
        }
    }

    /// The cross-instance failover loop. Picks the pinned instance if one
    /// is named and present in `instances`, otherwise `instances[0]`
    /// (already shuffled by discovery). Never re-resolves `instances`
    /// mid-loop — the snapshot is frozen at the caller.
    async fn try_api_request(
        &self,
        mut instances: Vec<PresenceEntry>,
        parsed: &ParsedRoute,
        msg: &UmfMessage,
        send_opts: Option<SendOptions>,
    ) -> Result<DispatchResponse, DispatchError> {
        loop {
            if instances.is_empty() {
                self.emit_metric("attempts:exhausted");
                #[cfg(feature = "otel")]
                tracing::warn!(
                    service = %parsed.service_name,
                    "failover exhausted all candidate instances"
                );
                return Ok(DispatchResponse::synthetic(
                    503,
                    format!("An instance of {} is unavailable", parsed.service_name),
                ));
            }

            let pick_idx = parsed
                .instance
                .as_deref()
                .and_then(|pinned| {
                    instances
                        .iter()
                        .position(|entry| entry.presence.instance_id == pinned)
                })
                .unwrap_or(0);
            let candidate = instances[pick_idx].clone();

            let still_present = self
                .discovery
                .instance_is_present(&parsed.service_name, &candidate.presence.instance_id)
                .await
                .unwrap_or(false);

            if still_present {
                let url = format!(
                    "http://{}:{}{}",
                    candidate.presence.ip, candidate.presence.port, parsed.api_route
                );
                let method = parsed.http_method.as_deref().unwrap_or("get");
                let request = self.build_request(&url, method, msg, send_opts.clone())?;
                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        if (200..300).contains(&status) {
                            return Ok(self.build_success_response(status, resp).await);
                        }
                        self.emit_metric(format!(
                            "service:unavailable|{}|{}|http {}",
                            parsed.service_name, candidate.presence.instance_id, status
                        ));
                        #[cfg(feature = "otel")]
                        tracing::warn!(
                            service = %parsed.service_name,
                            instance_id = %candidate.presence.instance_id,
                            status,
                            "failing over: instance returned non-2xx"
                        );
                    }
                    Err(e) => {
                        self.emit_metric(format!(
                            "service:unavailable|{}|{}|{}",
                            parsed.service_name, candidate.presence.instance_id, e
                        ));
                        #[cfg(feature = "otel")]
                        tracing::warn!(
                            service = %parsed.service_name,
                            instance_id = %candidate.presence.instance_id,
                            error = %e,
                            "failing over: request send failed"
                        );
                    }
                }
            } else {
                self.emit_metric(format!(
                    "service:unavailable|{}|{}|stale presence",
                    parsed.service_name, candidate.presence.instance_id
                ));
                #[cfg(feature = "otel")]
                tracing::warn!(
                    service = %parsed.service_name,
                    instance_id = %candidate.presence.instance_id,
                    "failing over: instance presence is stale"
                );
            }

            instances.remove(pick_idx);
        }
    }

    async fn build_success_response(
        &self,
        status: u16,
        resp: reqwest::Response,
    ) -> DispatchResponse {
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_default()
            .to_lowercase();
        let text = resp.text().await.unwrap_or_default();

        if content_type.contains("json") {
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => DispatchResponse {
                    status_code: status,
                    headers,
                    body: parsed,
                },
                Err(_) => DispatchResponse {
                    status_code: status,
                    headers,
                    body: Value::String(text),
                },
            }
        } else {
            DispatchResponse {
                status_code: status,
                headers,
                body: Value::String(text),
            }
        }
    }

    fn build_request(
        &self,
        url: &str,
        method: &str,
        msg: &UmfMessage,
        send_opts: Option<SendOptions>,
    ) -> Result<reqwest::RequestBuilder, DispatchError> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| DispatchError::RequestBuild(e.to_string()))?;
        let mut builder = self.client.request(method.clone(), url);

        if matches!(method, reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH) {
            builder = builder.header("content-type", "application/json");
        }
        if let Some(headers) = &msg.headers {
            for (key, value) in headers {
                if let Some(value_str) = value.as_str() {
                    builder = builder.header(key, value_str);
                }
            }
        }
        if let Some(auth) = &msg.authorization {
            builder = builder.header("authorization", auth);
        }
        if matches!(method, reqwest::Method::POST | reqwest::Method::PUT) {
            builder = builder.json(&msg.body);
        }

        let timeout = send_opts
            .and_then(|o| o.timeout_override)
            .or_else(|| msg.timeout.map(Duration::from_secs_f64));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::FabricConfig;
    use crate::coordinator::{Coordinator, MemoryCoordinator};
    use crate::presence::PresenceEngine;

    fn dispatcher_over(coordinator: Arc<dyn Coordinator>) -> Dispatcher {
        let discovery = Arc::new(Discovery::new(coordinator, "hydra:service"));
        let (tx, _rx) = broadcast::channel(32);
        Dispatcher::new(discovery, tx)
    }

    /// Binds an ephemeral port, then drops the listener so the port is
    /// immediately refusing connections — a cheap stand-in for "instance
    /// registered but unreachable" without relying on timeouts.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Spawns a minimal HTTP server that always answers `200 {"ok":true}`,
    /// returning the port it bound to. The listener loop is dropped along
    /// with the test's tokio runtime.
    async fn spawn_ok_server() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                            b"{\"ok\":true}",
                        ))))
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        addr.port()
    }

    /// Registers a presence entry for `service` at `port` on a shared
    /// coordinator, via a dedicated `PresenceEngine` (its own instance
    /// identity, its own tick timers never started).
    async fn register_instance(coordinator: &Arc<dyn Coordinator>, service: &str, port: u16) {
        let mut config = FabricConfig::new(service).unwrap();
        config.service_ip = "127.0.0.1".to_string();
        config.service_port = port;
        config.service_type = "test".to_string();
        let (tx, _rx) = broadcast::channel(16);
        let engine = PresenceEngine::new(Arc::clone(coordinator), config, tx);
        engine.register_service().await.unwrap();
    }

    #[tokio::test]
    async fn missing_to_from_or_body_is_a_synthetic_400() {
        let dispatcher = dispatcher_over(Arc::new(MemoryCoordinator::new()));
        let msg = UmfMessage::new("", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn missing_http_method_is_a_synthetic_400() {
        let dispatcher = dispatcher_over(Arc::new(MemoryCoordinator::new()));
        let msg = UmfMessage::new("billing:/accounts", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn empty_api_route_is_a_synthetic_400() {
        let dispatcher = dispatcher_over(Arc::new(MemoryCoordinator::new()));
        let msg = UmfMessage::new("billing:[get]", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();
        assert_eq!(resp.status_code, 400);
    }

    #[tokio::test]
    async fn no_presence_resolves_to_synthetic_503_with_metric() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let dispatcher = dispatcher_over(Arc::clone(&coordinator));
        let mut metrics = dispatcher.events.subscribe();

        let msg = UmfMessage::new("billing:[get]/accounts", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();

        assert_eq!(resp.status_code, 503);
        match metrics.recv().await.unwrap() {
            FabricEvent::Metric(m) => assert_eq!(m, "service:unavailable|billing|no presence"),
            other => panic!("expected a metric event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failover_skips_unreachable_instances_and_succeeds_on_the_third() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let dead_a = closed_port().await;
        let dead_b = closed_port().await;
        let live = spawn_ok_server().await;

        register_instance(&coordinator, "billing", dead_a).await;
        register_instance(&coordinator, "billing", dead_b).await;
        register_instance(&coordinator, "billing", live).await;

        let dispatcher = dispatcher_over(Arc::clone(&coordinator));
        let mut metrics = dispatcher.events.subscribe();

        let msg = UmfMessage::new("billing:[get]/accounts", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, serde_json::json!({ "ok": true }));

        let mut unavailable_metrics = 0;
        while let Ok(event) = metrics.try_recv() {
            if let FabricEvent::Metric(m) = event {
                if m.starts_with("service:unavailable|billing|") {
                    unavailable_metrics += 1;
                }
            }
        }
        assert_eq!(unavailable_metrics, 2);
    }

    #[tokio::test]
    async fn all_instances_unreachable_exhausts_to_synthetic_503() {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let dead_a = closed_port().await;
        let dead_b = closed_port().await;
        register_instance(&coordinator, "billing", dead_a).await;
        register_instance(&coordinator, "billing", dead_b).await;

        let dispatcher = dispatcher_over(Arc::clone(&coordinator));
        let msg = UmfMessage::new("billing:[get]/accounts", "caller:1", serde_json::json!({}));
        let resp = dispatcher.make_api_request(&msg, None).await.unwrap();

        assert_eq!(resp.status_code, 503);
    }
}
