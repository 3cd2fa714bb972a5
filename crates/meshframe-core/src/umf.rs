//! Unified Message Format (UMF): the structured envelope carried over the
//! message bus, queues, and HTTP dispatch.
//!
//! A message has two wire representations — long form (`from`, `body`,
//! `headers`, …) and short form (`frm`, `bdy`, `hdr`, …) — that are a
//! lossless rename of the same field set. [`UmfMessage`] is the canonical,
//! form-agnostic in-memory representation; [`UmfMessage::to_long_json`] and
//! [`UmfMessage::to_short_json`] render either wire form, and
//! [`UmfMessage::from_json`] accepts either on the way in.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::util::new_instance_id;

/// Default UMF protocol version stamped on constructed messages.
pub const DEFAULT_VERSION: &str = "UMF/1.4.6";

/// The canonical, form-agnostic UMF envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct UmfMessage {
    /// Destination route, e.g. `"service:[get]/path"`.
    pub to: String,
    /// Sender identity, typically `"serviceName:instanceID"`.
    pub from: String,
    /// Message payload. Any non-null JSON value.
    pub body: Value,
    /// Message ID; auto-generated (UUIDv4, undashed) if absent.
    pub mid: Option<String>,
    /// Correlation ID set on replies to the originating message's `mid`.
    pub rmid: Option<String>,
    /// ISO-8601 creation timestamp; auto-generated if absent.
    pub timestamp: Option<String>,
    /// Protocol version, defaults to [`DEFAULT_VERSION`].
    pub version: Option<String>,
    /// Free-form message type.
    pub typ: Option<String>,
    /// Reply-via override route.
    pub via: Option<String>,
    /// Opaque forwarding marker preserved across replies.
    pub forward: Option<String>,
    /// Per-attempt timeout in seconds, honored by the HTTP dispatcher.
    pub timeout: Option<f64>,
    /// Extra HTTP-style headers, opaque to the fabric.
    pub headers: Option<Map<String, Value>>,
    /// Opaque authorization token; the fabric never inspects it.
    pub authorization: Option<String>,
    /// HMAC signature over the message, set by [`UmfMessage::sign`].
    pub signature: Option<String>,
}

impl UmfMessage {
    /// Constructs a new message, auto-filling `mid`, `timestamp`, and
    /// `version` the way [`UmfMessage::from_json`] would for a message that
    /// omits them.
    pub fn new(to: impl Into<String>, from: impl Into<String>, body: Value) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            body,
            mid: Some(new_instance_id()),
            rmid: None,
            timestamp: Some(Utc::now().to_rfc3339()),
            version: Some(DEFAULT_VERSION.to_string()),
            typ: None,
            via: None,
            forward: None,
            timeout: None,
            headers: None,
            authorization: None,
            signature: None,
        }
    }

    /// A message is valid iff `to`, `from`, and `body` are all present and
    /// non-empty. `body` may be any non-null JSON value, including `{}`.
    pub fn validate(&self) -> bool {
        !self.to.trim().is_empty() && !self.from.trim().is_empty() && !self.body.is_null()
    }

    /// Renders the long wire form: canonical field names, `mid`/`timestamp`/
    /// `version` filled in if absent.
    pub fn to_long_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("to".into(), Value::String(self.to.clone()));
        map.insert("from".into(), Value::String(self.from.clone()));
        map.insert("body".into(), self.body.clone());
        map.insert(
            "mid".into(),
            Value::String(self.mid.clone().unwrap_or_else(new_instance_id)),
        );
        if let Some(rmid) = &self.rmid {
            map.insert("rmid".into(), Value::String(rmid.clone()));
        }
        map.insert(
            "timestamp".into(),
            Value::String(
                self.timestamp
                    .clone()
                    .unwrap_or_else(|| Utc::now().to_rfc3339()),
            ),
        );
        map.insert(
            "version".into(),
            Value::String(self.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string())),
        );
        if let Some(typ) = &self.typ {
            map.insert("type".into(), Value::String(typ.clone()));
        }
        if let Some(via) = &self.via {
            map.insert("via".into(), Value::String(via.clone()));
        }
        if let Some(forward) = &self.forward {
            map.insert("forward".into(), Value::String(forward.clone()));
        }
        if let Some(timeout) = self.timeout {
            map.insert("timeout".into(), serde_json::json!(timeout));
        }
        if let Some(headers) = &self.headers {
            map.insert("headers".into(), Value::Object(headers.clone()));
        }
        if let Some(auth) = &self.authorization {
            map.insert("authorization".into(), Value::String(auth.clone()));
        }
        if let Some(sig) = &self.signature {
            map.insert("signature".into(), Value::String(sig.clone()));
        }
        Value::Object(map)
    }

    /// Renders the short wire form (`frm`/`bdy`/`hdr`/… abbreviations).
    /// `to`, `mid`, `rmid`, and `via` are not abbreviated.
    pub fn to_short_json(&self) -> Value {
        let long = self.to_long_json();
        let long = long.as_object().expect("to_long_json always returns an object");
        let mut map = Map::new();
        for (key, value) in long {
            map.insert(long_to_short_key(key).into_owned(), value.clone());
        }
        Value::Object(map)
    }

    /// Parses either wire form into the canonical representation.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "UMF message must be a JSON object".to_string())?;

        let get_str = |long: &str, short: &str| -> Option<String> {
            obj.get(long)
                .or_else(|| obj.get(short))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let to = obj
            .get("to")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let from = get_str("from", "frm").unwrap_or_default();
        let body = obj
            .get("body")
            .or_else(|| obj.get("bdy"))
            .cloned()
            .unwrap_or(Value::Null);
        let mid = get_str("mid", "mid");
        let rmid = get_str("rmid", "rmid");
        let timestamp = get_str("timestamp", "ts");
        let version = get_str("version", "ver");
        let typ = get_str("type", "typ");
        let via = get_str("via", "via");
        let forward = get_str("forward", "fwd");
        let timeout = obj
            .get("timeout")
            .or_else(|| obj.get("tmo"))
            .and_then(|v| v.as_f64());
        let headers = obj
            .get("headers")
            .or_else(|| obj.get("hdr"))
            .and_then(|v| v.as_object())
            .cloned();
        let authorization = get_str("authorization", "aut");
        let signature = get_str("signature", "sig");

        Ok(Self {
            to,
            from,
            body,
            mid,
            rmid,
            timestamp,
            version,
            typ,
            via,
            forward,
            timeout,
            headers,
            authorization,
            signature,
        })
    }

    /// Builds a reply envelope: swaps `to`/`from`, sets `rmid` to this
    /// message's `mid`, routes to `via` if set, and preserves `forward`.
    pub fn reply_envelope(&self, response_body: Value) -> Self {
        let to = self.via.clone().unwrap_or_else(|| self.from.clone());
        let mut reply = UmfMessage::new(to, self.to.clone(), response_body);
        reply.rmid = self.mid.clone();
        reply.forward = self.forward.clone();
        reply
    }

    /// Computes an HMAC-SHA256 signature over `to|from|timestamp|body` and
    /// stores it (base64-encoded) in [`UmfMessage::signature`].
    pub fn sign(&mut self, secret: &str) {
        self.signature = Some(self.compute_signature(secret));
    }

    /// Returns true iff [`UmfMessage::signature`] matches the HMAC computed
    /// for `secret`.
    pub fn verify_signature(&self, secret: &str) -> bool {
        match &self.signature {
            Some(sig) => *sig == self.compute_signature(secret),
            None => false,
        }
    }

    fn compute_signature(&self, secret: &str) -> String {
        let timestamp = self.timestamp.clone().unwrap_or_default();
        let payload = format!(
            "{}|{}|{}|{}",
            self.to,
            self.from,
            timestamp,
            self.body
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }
}

fn long_to_short_key(key: &str) -> std::borrow::Cow<'static, str> {
    match key {
        "from" => "frm".into(),
        "body" => "bdy".into(),
        "headers" => "hdr".into(),
        "signature" => "sig".into(),
        "timeout" => "tmo".into(),
        "timestamp" => "ts".into(),
        "type" => "typ".into(),
        "version" => "ver".into(),
        "forward" => "fwd".into(),
        "authorization" => "aut".into(),
        "to" => "to".into(),
        "mid" => "mid".into(),
        "rmid" => "rmid".into(),
        "via" => "via".into(),
        other => other.to_string().into(),
    }
}

/// The decomposition of a UMF `to` field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedRoute {
    /// Pinned instance ID, if the route began with `instance@` or
    /// `instance-subID@`.
    pub instance: Option<String>,
    /// Sub-instance ID, present only alongside a pinned `instance`.
    pub sub_id: Option<String>,
    /// Target service name (or an `http(s)://…` origin for passthrough).
    pub service_name: String,
    /// Lowercased HTTP method extracted from a `[METHOD]` prefix, if any.
    pub http_method: Option<String>,
    /// The API route, with any `[METHOD]` prefix stripped.
    pub api_route: String,
    /// Non-empty iff parsing failed; the message describes the failure.
    pub error: String,
}

/// Parses a UMF `to` field per the fabric's route grammar (see
/// `SPEC_FULL.md` §3, "Parsed Route").
pub fn parse_route(to: &str) -> ParsedRoute {
    let mut segments: Vec<String> = to.split(':').map(|s| s.to_string()).collect();
    if segments.len() < 2 {
        return ParsedRoute {
            error: format!("Unable to parse route: '{}'", to),
            ..Default::default()
        };
    }

    let mut instance = None;
    let mut sub_id = None;
    if let Some(at_pos) = segments[0].find('@') {
        let prefix = segments[0][..at_pos].to_string();
        let rest = segments[0][at_pos + 1..].to_string();
        if let Some(dash_pos) = prefix.find('-') {
            instance = Some(prefix[..dash_pos].to_string());
            sub_id = Some(prefix[dash_pos + 1..].to_string());
        } else {
            instance = Some(prefix);
        }
        segments[0] = rest;
    }

    if segments.len() >= 2 && segments[0].starts_with("http") {
        let joined = format!("{}:{}", segments[0], segments[1]);
        segments.splice(0..2, [joined]);
    }

    if segments.is_empty() {
        return ParsedRoute {
            error: format!("Unable to parse route: '{}'", to),
            ..Default::default()
        };
    }

    let service_name = segments[0].clone();
    let mut api_route = segments[1..].join(":");

    let mut http_method = None;
    if api_route.starts_with('[') {
        match api_route.find(']') {
            Some(close) => {
                http_method = Some(api_route[1..close].to_lowercase());
                api_route = api_route[close + 1..].to_string();
            }
            None => {
                return ParsedRoute {
                    error: format!("Unclosed '[' in route: '{}'", to),
                    ..Default::default()
                };
            }
        }
    }

    ParsedRoute {
        instance,
        sub_id,
        service_name,
        http_method,
        api_route,
        error: String::new(),
    }
}

/// A route pattern string paired with its original form, used when
/// enumerating `getAllServiceRoutes` results grouped by service.
pub type ServiceRouteMap = BTreeMap<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_to_from_body() {
        let mut msg = UmfMessage::new("x", "y", json!({}));
        assert!(msg.validate());
        msg.to = String::new();
        assert!(!msg.validate());
    }

    #[test]
    fn validate_missing_to_field() {
        let msg = UmfMessage {
            to: String::new(),
            from: "yyy".to_string(),
            body: json!({}),
            ..UmfMessage::new("", "", json!({}))
        };
        assert!(!msg.validate());
    }

    #[test]
    fn long_short_round_trip_is_lossless() {
        let mut msg = UmfMessage::new("svc:[get]/x", "caller", json!({"k": "v"}));
        msg.typ = Some("request".to_string());
        msg.forward = Some("fwd-marker".to_string());
        msg.timeout = Some(5.0);

        let short = msg.to_short_json();
        let decoded = UmfMessage::from_json(&short).unwrap();
        let short_again = decoded.to_short_json();
        assert_eq!(short, short_again);
    }

    #[test]
    fn short_form_uses_expected_abbreviations() {
        let msg = UmfMessage::new("svc:[get]/x", "caller", json!({"k": "v"}));
        let short = msg.to_short_json();
        let obj = short.as_object().unwrap();
        assert!(obj.contains_key("frm"));
        assert!(obj.contains_key("bdy"));
        assert!(obj.contains_key("ts"));
        assert!(obj.contains_key("ver"));
        assert!(!obj.contains_key("from"));
        assert!(obj.contains_key("to"));
        assert!(obj.contains_key("mid"));
    }

    #[test]
    fn parse_route_with_pinned_instance_and_subid() {
        let parsed = parse_route("test-subtest@service:xxx:yyy");
        assert_eq!(parsed.instance.as_deref(), Some("test"));
        assert_eq!(parsed.sub_id.as_deref(), Some("subtest"));
        assert_eq!(parsed.service_name, "service");
        assert_eq!(parsed.api_route, "xxx:yyy");
        assert_eq!(parsed.error, "");
    }

    #[test]
    fn parse_route_too_few_segments_errors() {
        let parsed = parse_route("xx");
        assert!(!parsed.error.is_empty());
    }

    #[test]
    fn parse_route_http_passthrough_rejoins_scheme() {
        let parsed = parse_route("http:/V1/URL/xxx123:[get]route");
        assert_eq!(parsed.service_name, "http:/V1/URL/xxx123");
        assert_eq!(parsed.http_method.as_deref(), Some("get"));
        assert_eq!(parsed.api_route, "route");
    }

    #[test]
    fn parse_route_unclosed_bracket_errors() {
        let parsed = parse_route("service:[get/x");
        assert!(!parsed.error.is_empty());
    }

    #[test]
    fn reply_envelope_swaps_to_from_and_sets_rmid() {
        let original = UmfMessage::new("svc:[get]/x", "caller", json!({}));
        let reply = original.reply_envelope(json!({"ok": true}));
        assert_eq!(reply.to, "caller");
        assert_eq!(reply.from, "svc:[get]/x");
        assert_eq!(reply.rmid, original.mid);
    }

    #[test]
    fn reply_envelope_honors_via_override() {
        let mut original = UmfMessage::new("svc:[get]/x", "caller", json!({}));
        original.via = Some("gateway".to_string());
        let reply = original.reply_envelope(json!({}));
        assert_eq!(reply.to, "gateway");
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let mut msg = UmfMessage::new("svc:[get]/x", "caller", json!({"k": 1}));
        msg.sign("secret");
        assert!(msg.verify_signature("secret"));
        assert!(!msg.verify_signature("wrong-secret"));
    }

    proptest::proptest! {
        #[test]
        fn short_form_is_stable_under_round_trip(
            to in "[a-z]{1,10}:\\[get\\]/[a-z]{1,10}",
            from in "[a-z]{1,10}",
            body_key in "[a-z]{1,8}",
            body_val in "[a-z0-9]{0,12}",
        ) {
            let msg = UmfMessage::new(&to, &from, json!({ body_key: body_val }));
            let short = msg.to_short_json();
            let decoded = UmfMessage::from_json(&short).unwrap();
            prop_assert_eq!(short, decoded.to_short_json());
        }
    }
}
