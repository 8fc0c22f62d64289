//! Plugin registry.
//!
//! A plugin is a named collection of RPC methods plus the external
//! packages it needs on the host. Plugins are compiled into the agent and
//! activated by manifest files dropped into a directory the keeper syncs;
//! activating a plugin installs its required packages through the host
//! package manager and registers its methods under `<plugin>.<method>`.

use super::dispatch::{Dispatcher, RpcMethod};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info};

/// File extension that marks a plugin manifest, e.g. `disk_usage.plugin`.
pub const MANIFEST_EXTENSION: &str = "plugin";

/// Per-plugin mutable state, created on first use and never persisted.
/// Handed to plugin methods as an explicit parameter through the request
/// context.
#[derive(Clone, Default)]
pub struct PluginStorage(Arc<std::sync::Mutex<HashMap<String, Value>>>);

impl PluginStorage {
    pub fn insert(&self, key: &str, value: Value) {
        self.0.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

pub trait VaultPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Host packages that must be present before the plugin's methods can
    /// run.
    fn required_packages(&self) -> Vec<String> {
        Vec::new()
    }

    fn methods(&self) -> Vec<(&'static str, Arc<dyn RpcMethod>)>;
}

/// Compiled-in plugins an agent can activate.
#[derive(Default)]
pub struct PluginRegistry {
    available: HashMap<String, Arc<dyn VaultPlugin>>,
}

impl PluginRegistry {
    pub fn register(&mut self, plugin: Arc<dyn VaultPlugin>) {
        self.available.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VaultPlugin>> {
        self.available.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.available.keys().cloned().collect()
    }
}

/// Scan `directory` for plugin manifests and activate each named plugin.
/// Returns the names of the plugins that ended up registered. A plugin
/// whose package installation fails is skipped with an error log; it does
/// not abort the others.
pub async fn load_plugins(
    dispatcher: &Dispatcher,
    registry: &PluginRegistry,
    directory: &Path,
    package_manager: &[String],
) -> std::io::Result<Vec<String>> {
    tokio::fs::create_dir_all(directory).await?;

    let mut loaded = Vec::new();
    let mut entries = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let Some(plugin) = registry.get(name) else {
            error!(plugin = name, "unknown plugin manifest, skipping");
            continue;
        };

        let packages = plugin.required_packages();
        if !packages.is_empty() {
            if let Err(err) = install_packages(package_manager, &packages).await {
                error!(plugin = name, %err, "error installing plugin packages, skipping");
                continue;
            }
        }

        dispatcher.register_plugin(plugin.as_ref());
        info!(plugin = name, "plugin loaded");
        loaded.push(name.to_string());
    }
    Ok(loaded)
}

async fn install_packages(package_manager: &[String], packages: &[String]) -> Result<(), String> {
    let Some((program, base_args)) = package_manager.split_first() else {
        return Err("no package manager configured".to_string());
    };

    debug!(?packages, "installing plugin packages");
    let status = Command::new(program)
        .args(base_args)
        .args(packages)
        .status()
        .await
        .map_err(|e| e.to_string())?;

    if !status.success() {
        return Err(format!("package manager exited with {status}"));
    }
    Ok(())
}
