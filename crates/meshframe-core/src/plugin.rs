//! Plugin host: serial lifecycle hooks run around fabric registration and
//! config updates.
//!
//! A plugin is anything implementing [`Plugin`]. Hooks run strictly in
//! registration order and never concurrently with each other — a later
//! plugin may depend on mutations an earlier one made during `set_hydra`
//! or `set_config`, so parallelizing them would be observable breakage,
//! not just a missed optimization.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::facade::Fabric;

/// Lifecycle hooks a fabric extension implements.
///
/// Every hook has a no-op default so a plugin only needs to override the
/// ones it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name. Used to key cached options in [`PluginHost::config_update`]
    /// and to look up this plugin's slice of `hydra.plugins` in `set_config`.
    fn name(&self) -> &str;

    /// Runs once per plugin, in registration order, before `init`'s core
    /// registration sequence. Gives the plugin a cheap-clone handle to the
    /// fabric it's extending.
    async fn set_hydra(&self, fabric: Fabric) {
        let _ = fabric;
    }

    /// Runs during `init`, before the core registration sequence, with this
    /// plugin's opaque options block from `hydra.plugins.<name>`.
    async fn set_config(&self, plugin_config: Value) {
        let _ = plugin_config;
    }

    /// Runs after the fabric has completed registration.
    async fn on_service_ready(&self) {}

    /// Runs whenever application code emits a config-update event, with the
    /// freshly reloaded per-service configuration.
    async fn update_config(&self, service_config: Value) {
        let _ = service_config;
    }

    /// Runs only when the options passed to `update_config` differ, by JSON
    /// equality, from the previous call for this plugin.
    async fn config_changed(&self, opts: Value) {
        let _ = opts;
    }
}

/// Drives plugin lifecycle hooks serially, in registration order.
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
    last_opts: Mutex<HashMap<String, Value>>,
}

impl PluginHost {
    /// An empty host with no registered plugins.
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            last_opts: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a plugin. Order is preserved; it determines hook order.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// `true` iff no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// The number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// `use(plugins…)`: sequentially runs `set_hydra` on every plugin, in
    /// registration order.
    pub async fn use_plugins(&self, fabric: Fabric) {
        for plugin in &self.plugins {
            #[cfg(feature = "otel")]
            tracing::info!(plugin = %plugin.name(), "running set_hydra");
            plugin.set_hydra(fabric.clone()).await;
        }
    }

    /// Sequentially runs `set_config`, handing each plugin its own slice of
    /// `plugin_configs` (keyed by [`Plugin::name`]), defaulting to `null`.
    pub async fn set_config(&self, plugin_configs: &HashMap<String, Value>) {
        for plugin in &self.plugins {
            let config = plugin_configs.get(plugin.name()).cloned().unwrap_or(Value::Null);
            #[cfg(feature = "otel")]
            tracing::info!(plugin = %plugin.name(), "running set_config");
            plugin.set_config(config).await;
        }
    }

    /// Sequentially runs `on_service_ready`.
    pub async fn on_service_ready(&self) {
        for plugin in &self.plugins {
            #[cfg(feature = "otel")]
            tracing::info!(plugin = %plugin.name(), "running on_service_ready");
            plugin.on_service_ready().await;
        }
    }

    /// Sequentially runs `update_config`, firing `config_changed` for a
    /// plugin only when `opts` differs from the copy cached on its previous
    /// call.
    pub async fn config_update(&self, opts: Value) {
        for plugin in &self.plugins {
            plugin.update_config(opts.clone()).await;

            let changed = {
                let mut cache = self.last_opts.lock();
                let changed = cache.get(plugin.name()) != Some(&opts);
                cache.insert(plugin.name().to_string(), opts.clone());
                changed
            };
            if changed {
                #[cfg(feature = "otel")]
                tracing::info!(plugin = %plugin.name(), "plugin config changed");
                plugin.config_changed(opts.clone()).await;
            }
        }
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingPlugin {
        name: String,
        calls: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn set_hydra(&self, _fabric: Fabric) {
            self.calls.lock().await.push(format!("{}:set_hydra", self.name));
        }

        async fn set_config(&self, _plugin_config: Value) {
            self.calls.lock().await.push(format!("{}:set_config", self.name));
        }

        async fn on_service_ready(&self) {
            self.calls.lock().await.push(format!("{}:on_service_ready", self.name));
        }

        async fn update_config(&self, _service_config: Value) {
            self.calls.lock().await.push(format!("{}:update_config", self.name));
        }

        async fn config_changed(&self, _opts: Value) {
            self.calls.lock().await.push(format!("{}:config_changed", self.name));
        }
    }

    #[tokio::test]
    async fn on_service_ready_runs_serially_in_registration_order() {
        let calls = Arc::new(AsyncMutex::new(Vec::new()));
        let mut host = PluginHost::new();
        host.register(Arc::new(RecordingPlugin {
            name: "a".to_string(),
            calls: Arc::clone(&calls),
        }));
        host.register(Arc::new(RecordingPlugin {
            name: "b".to_string(),
            calls: Arc::clone(&calls),
        }));

        host.on_service_ready().await;

        let recorded = calls.lock().await.clone();
        assert_eq!(
            recorded,
            vec!["a:on_service_ready".to_string(), "b:on_service_ready".to_string()]
        );
    }

    #[tokio::test]
    async fn config_update_fires_config_changed_only_on_difference() {
        let calls = Arc::new(AsyncMutex::new(Vec::new()));
        let mut host = PluginHost::new();
        host.register(Arc::new(RecordingPlugin {
            name: "a".to_string(),
            calls: Arc::clone(&calls),
        }));

        host.config_update(serde_json::json!({"k": 1})).await;
        host.config_update(serde_json::json!({"k": 1})).await;
        host.config_update(serde_json::json!({"k": 2})).await;

        let recorded = calls.lock().await.clone();
        assert_eq!(
            recorded,
            vec![
                "a:update_config".to_string(),
                "a:config_changed".to_string(),
                "a:update_config".to_string(),
                "a:update_config".to_string(),
                "a:config_changed".to_string(),
            ]
        );
    }

    #[test]
    fn empty_host_reports_len_zero() {
        let host = PluginHost::new();
        assert!(host.is_empty());
        assert_eq!(host.len(), 0);
    }
}
