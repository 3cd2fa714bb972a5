//! Fabric configuration: the `hydra` settings block plus its environment
//! overrides (`HYDRA_REDIS_URL`, `HYDRA_SERVICE`).

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;

/// Default coordinator keyspace prefix.
pub const DEFAULT_PREFIX: &str = "hydra:service";
/// TTL (seconds) on the presence and health keys.
pub const KEY_EXPIRATION_TTL: u64 = 3;
/// Presence tick interval, seconds.
pub const PRESENCE_UPDATE_INTERVAL: u64 = 1;
/// Health tick interval, seconds.
pub const HEALTH_UPDATE_INTERVAL: u64 = 5;
/// Capped length of the health log list.
pub const MAX_ENTRIES_IN_HEALTH_LOG: usize = 64;
/// TTL (seconds) on the health log key: one week.
pub const HEALTH_LOG_TTL: u64 = 7 * 24 * 60 * 60;

/// Fabric configuration loaded from defaults, environment, and explicit
/// builder calls, in that priority order (highest first: explicit calls).
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Required. Lower-cased; must not contain `:` or whitespace.
    pub service_name: String,
    /// Required. `0` means auto-select (not implemented by this crate —
    /// port binding is an external collaborator's job per the fabric's
    /// scope).
    pub service_port: u16,
    /// Resolved service IP. Empty means "not yet resolved"; callers
    /// resolving the local IP do so outside this crate.
    pub service_ip: String,
    /// DNS name, if set, wins over `service_ip` when advertising presence.
    pub service_dns: Option<String>,
    /// Service semantic version, free-form.
    pub service_version: String,
    /// Free-form service type, used by the Service Record.
    pub service_type: String,
    /// Free-form human description.
    pub service_description: String,
    /// Coordinator connection URL (`redis://…`).
    pub redis_url: String,
    /// Opaque per-plugin configuration blobs.
    pub plugins: HashMap<String, Value>,
    /// Coordinator keyspace prefix.
    pub key_prefix: String,
}

impl FabricConfig {
    /// Starts a config with only the required `serviceName` set; everything
    /// else takes its default.
    pub fn new(service_name: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            service_name: service_name.into(),
            service_port: 0,
            service_ip: String::new(),
            service_dns: None,
            service_version: "0.0.0".to_string(),
            service_type: String::new(),
            service_description: String::new(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            plugins: HashMap::new(),
            key_prefix: DEFAULT_PREFIX.to_string(),
        };
        config.validate_service_name()?;
        Ok(config)
    }

    /// Loads configuration from the environment, applying `HYDRA_REDIS_URL`
    /// and `HYDRA_SERVICE` overrides on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_name = env::var("SERVICE_NAME")
            .map_err(|_| ConfigError::MissingField("serviceName".to_string()))?;
        let mut config = Self::new(service_name)?;

        if let Ok(port) = env::var("SERVICE_PORT") {
            config.service_port = port
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "servicePort".to_string(),
                    reason: format!("'{}' is not a valid port number", port),
                })?;
        }
        if let Ok(ip) = env::var("SERVICE_IP") {
            config.service_ip = ip;
        }
        if let Ok(url) = env::var("HYDRA_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(overrides) = env::var("HYDRA_SERVICE") {
            config.apply_hydra_service_override(&overrides)?;
        }

        config.validate_service_name()?;
        Ok(config)
    }

    /// Applies the `HYDRA_SERVICE` override string: pipe-separated
    /// `key=val|…` pairs, a JSON object, or (unsupported here — that mode
    /// requires a live coordinator to fetch the Config Store entry, which
    /// is the caller's responsibility via [`crate::discovery::Discovery`]).
    fn apply_hydra_service_override(&mut self, raw: &str) -> Result<(), ConfigError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| ConfigError::Environment(e.to_string()))?;
            if let Some(obj) = value.as_object() {
                self.apply_json_overrides(obj);
            }
            return Ok(());
        }
        if trimmed.contains('=') {
            for pair in trimmed.split('|') {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next().unwrap_or_default().trim();
                let value = parts.next().unwrap_or_default().trim();
                if key.is_empty() {
                    continue;
                }
                self.apply_key_value_override(key, value);
            }
            return Ok(());
        }
        // A bare `service:version` label names a Config Store entry; this
        // crate leaves fetching it to the discovery layer, since it
        // requires a coordinator connection this function doesn't have.
        Err(ConfigError::Environment(format!(
            "'{}' names a Config Store label; fetch it via Discovery::get_config before calling FabricConfig::from_env",
            trimmed
        )))
    }

    fn apply_json_overrides(&mut self, obj: &serde_json::Map<String, Value>) {
        for (key, value) in obj {
            if let Some(s) = value.as_str() {
                self.apply_key_value_override(key, s);
            }
        }
    }

    fn apply_key_value_override(&mut self, key: &str, value: &str) {
        match key {
            "serviceName" => self.service_name = value.to_string(),
            "servicePort" => {
                if let Ok(port) = value.parse() {
                    self.service_port = port;
                }
            }
            "serviceIP" => self.service_ip = value.to_string(),
            "serviceDNS" => self.service_dns = Some(value.to_string()),
            "serviceVersion" => self.service_version = value.to_string(),
            "serviceType" => self.service_type = value.to_string(),
            "serviceDescription" => self.service_description = value.to_string(),
            _ => {}
        }
    }

    fn validate_service_name(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::MissingField("serviceName".to_string()));
        }
        if self.service_name.contains(':') || self.service_name.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "serviceName".to_string(),
                reason: "must not contain ':' or whitespace".to_string(),
            });
        }
        Ok(())
    }

    /// Lower-cased service name, as stored in the Service Record.
    pub fn normalized_service_name(&self) -> String {
        self.service_name.to_lowercase()
    }

    /// The key that wins for presence/health advertisement: DNS name if
    /// set, otherwise the resolved IP.
    pub fn advertised_host(&self) -> &str {
        self.service_dns.as_deref().unwrap_or(&self.service_ip)
    }

    /// Loads configuration from a TOML document, then applies the same
    /// environment overrides [`Self::from_env`] would (`HYDRA_REDIS_URL`,
    /// `HYDRA_SERVICE`), which still win over file values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: FabricConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))?;
        let mut config = Self::new(file.service_name)?;
        config.service_port = file.service_port.unwrap_or(config.service_port);
        config.service_ip = file.service_ip.unwrap_or(config.service_ip);
        config.service_dns = file.service_dns.or(config.service_dns);
        config.service_version = file.service_version.unwrap_or(config.service_version);
        config.service_type = file.service_type.unwrap_or(config.service_type);
        config.service_description = file.service_description.unwrap_or(config.service_description);
        config.redis_url = file.redis_url.unwrap_or(config.redis_url);
        config.key_prefix = file.key_prefix.unwrap_or(config.key_prefix);

        if let Ok(url) = env::var("HYDRA_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(overrides) = env::var("HYDRA_SERVICE") {
            config.apply_hydra_service_override(&overrides)?;
        }

        config.validate_service_name()?;
        Ok(config)
    }

    /// Reads `path` and loads it via [`Self::from_toml`].
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Toml(e.to_string()))?;
        Self::from_toml(&contents)
    }
}

/// The on-disk shape of a TOML fabric config file. Every field but
/// `service_name` is optional; unset fields keep [`FabricConfig::new`]'s
/// defaults.
#[derive(Debug, Deserialize)]
struct FabricConfigFile {
    service_name: String,
    service_port: Option<u16>,
    service_ip: Option<String>,
    service_dns: Option<String>,
    service_version: Option<String>,
    service_type: Option<String>,
    service_description: Option<String>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
}
