//! Route registry: publishing a service's routes and matching inbound paths
//! against them.
//!
//! The coordinator only ever sees route *patterns* as opaque strings
//! (`"[get]/orders/:id"`); compiling a pattern into something that can
//! accept or reject a concrete path is this crate's own job — there's no
//! router library in the dependency stack, so [`PathMatcher`] is hand-rolled
//! against the grammar §4.3 describes (`:param` and `*rest` segments).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::coordinator::{Coordinator, CoordinatorOp};
use crate::error::RoutesError;

/// The three routes injected into every service's route set, backing the
/// router's default health/probe endpoints.
fn self_routes(service: &str) -> Vec<String> {
    vec![
        format!("[get]/{service}"),
        format!("[get]/{service}/"),
        format!("[get]/{service}/:rest"),
    ]
}

/// The name reserved for the fabric's own router service; it never receives
/// its own route-refresh broadcast (there's nothing to notify).
pub const ROUTER_SERVICE_NAME: &str = "hydra-router";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param,
    Rest,
}

/// A compiled route pattern: an HTTP method plus a path template.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMatcher {
    method: Option<String>,
    pattern: String,
    segments: Vec<Segment>,
}

impl PathMatcher {
    /// Compiles `pattern` (e.g. `"[get]/orders/:id"`) into a matcher.
    /// Fails if the bracketed method prefix is unterminated.
    pub fn compile(pattern: &str) -> Result<Self, RoutesError> {
        let (method, path) = split_method_prefix(pattern)?;
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(rest) = s.strip_prefix('*') {
                    let _ = rest;
                    Segment::Rest
                } else if s.starts_with(':') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Ok(Self {
            method,
            pattern: pattern.to_string(),
            segments,
        })
    }

    /// The original, uncompiled pattern string.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether `path` (optionally constrained by `method`) satisfies this
    /// matcher. A `*rest` segment consumes everything remaining, including
    /// zero further segments.
    pub fn matches(&self, method: Option<&str>, path: &str) -> bool {
        if let (Some(want), Some(got)) = (&self.method, method) {
            if !want.eq_ignore_ascii_case(got) {
                return false;
            }
        }
        let candidate: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&self.segments, &candidate)
    }
}

fn match_segments(segments: &[Segment], candidate: &[&str]) -> bool {
    let mut seg_iter = segments.iter();
    let mut idx = 0;
    while let Some(segment) = seg_iter.next() {
        match segment {
            Segment::Rest => return true, // consumes everything remaining
            Segment::Param => {
                if idx >= candidate.len() {
                    return false;
                }
                idx += 1;
            }
            Segment::Literal(want) => {
                if candidate.get(idx) != Some(&want.as_str()) {
                    return false;
                }
                idx += 1;
            }
        }
    }
    idx == candidate.len()
}

fn split_method_prefix(pattern: &str) -> Result<(Option<String>, &str), RoutesError> {
    if let Some(rest) = pattern.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| RoutesError::InvalidPattern(pattern.to_string()))?;
        let method = rest[..close].to_lowercase();
        Ok((Some(method), &rest[close + 1..]))
    } else {
        Ok((None, pattern))
    }
}

/// Publishes and matches a service's HTTP routes.
pub struct RouteRegistry {
    coordinator: Arc<dyn Coordinator>,
    key_prefix: String,
    service_name: String,
    compiled: RwLock<Vec<PathMatcher>>,
}

impl RouteRegistry {
    /// Builds a registry for `service_name` under `key_prefix`.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        key_prefix: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            key_prefix: key_prefix.into(),
            service_name: service_name.into(),
            compiled: RwLock::new(Vec::new()),
        }
    }

    fn routes_key(&self) -> String {
        format!("{}:{}:service:routes", self.key_prefix, self.service_name)
    }

    /// Atomically replaces the published route set with `routes` plus the
    /// three self-routes, compiles the result, and returns whether a
    /// route-refresh broadcast to `hydra-router:/refresh` is needed (the
    /// caller, which owns the message bus, is responsible for sending it —
    /// this crate's components don't hold circular references to each
    /// other).
    pub async fn register_routes(&self, routes: &[String]) -> Result<bool, RoutesError> {
        let mut members: Vec<String> = Vec::with_capacity(routes.len() + 3);
        let mut seen = std::collections::HashSet::with_capacity(routes.len() + 3);
        for route in routes.iter().chain(self_routes(&self.service_name).iter()) {
            if seen.insert(route.clone()) {
                members.push(route.clone());
            }
        }

        let key = self.routes_key();
        self.coordinator
            .atomic(vec![
                CoordinatorOp::Del { key: key.clone() },
                CoordinatorOp::SAdd {
                    key: key.clone(),
                    members: members.clone(),
                },
            ])
            .await
            .map_err(RoutesError::from)?;

        // Compile from `members`, not a `smembers` read-back: the
        // Coordinator's set has no ordering guarantee (Redis `SMEMBERS`
        // least of all), but `match_route` is first-match-wins over
        // re-addition order, so the compiled matchers must come from the
        // order we just built above.
        let mut compiled = Vec::with_capacity(members.len());
        for pattern in &members {
            compiled.push(PathMatcher::compile(pattern)?);
        }
        *self.compiled.write() = compiled;

        Ok(self.service_name != ROUTER_SERVICE_NAME)
    }

    /// Every service's published routes, keyed by service name.
    pub async fn get_all_service_routes(
        &self,
    ) -> Result<crate::umf::ServiceRouteMap, RoutesError> {
        let pattern = format!("{}:*:service:routes", self.key_prefix);
        let keys = self.coordinator.keys(&pattern).await?;
        let mut map = crate::umf::ServiceRouteMap::new();
        for key in keys {
            let Some(service_name) = key.split(':').nth(2) else {
                continue;
            };
            let members = self.coordinator.smembers(&key).await?;
            map.insert(service_name.to_string(), members);
        }
        Ok(map)
    }

    /// `true` iff any compiled matcher accepts `path` (first-match-wins;
    /// order is the order routes were last registered in).
    pub fn match_route(&self, method: Option<&str>, path: &str) -> bool {
        self.compiled
            .read()
            .iter()
            .any(|matcher| matcher.matches(method, path))
    }
}
