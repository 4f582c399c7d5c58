//! 插件管理器
//!
//! 按注册顺序加载插件，先加载其必需依赖；加载/卸载完成后分别触发
//! `plugin_loaded` / `plugin_unloaded` 事件。插件回调在注册表锁之外执行。

use crate::core::event::Event;
use crate::plugins::core::{Plugin, PluginId, PluginMetadata, PluginState};
use crate::plugins::service_provider::ServiceProvider;
use crate::{FoundryError, Result};
use parking_lot::Mutex;
use semver::Version;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

struct PluginEntry {
    metadata: PluginMetadata,
    plugin: SharedPlugin,
    state: PluginState,
}

/// 插件管理器
pub struct PluginManager {
    services: Arc<ServiceProvider>,
    framework_version: Version,
    plugins: Mutex<Vec<PluginEntry>>,
    plugin_loaded: Event<PluginMetadata>,
    plugin_unloaded: Event<PluginMetadata>,
}

impl PluginManager {
    pub fn new(services: Arc<ServiceProvider>) -> Self {
        let framework_version =
            Version::parse(crate::VERSION).unwrap_or_else(|_| Version::new(0, 1, 0));
        Self::with_framework_version(services, framework_version)
    }

    pub fn with_framework_version(services: Arc<ServiceProvider>, framework_version: Version) -> Self {
        Self {
            services,
            framework_version,
            plugins: Mutex::new(Vec::new()),
            plugin_loaded: Event::new(),
            plugin_unloaded: Event::new(),
        }
    }

    /// 插件加载完成事件
    pub fn plugin_loaded(&self) -> &Event<PluginMetadata> {
        &self.plugin_loaded
    }

    /// 插件卸载完成事件
    pub fn plugin_unloaded(&self) -> &Event<PluginMetadata> {
        &self.plugin_unloaded
    }

    pub fn services(&self) -> &Arc<ServiceProvider> {
        &self.services
    }

    /// 注册插件
    pub fn register(&self, plugin: Box<dyn Plugin>) -> Result<PluginId> {
        let metadata = plugin.metadata().clone();
        if !metadata.supports_framework(&self.framework_version) {
            return Err(FoundryError::plugin_load(&format!(
                "Plugin {} requires framework {} (running {})",
                metadata.name, metadata.min_framework_version, self.framework_version
            )));
        }

        let mut plugins = self.plugins.lock();
        if plugins.iter().any(|entry| entry.metadata.id == metadata.id) {
            return Err(FoundryError::PluginAlreadyRegistered {
                plugin_id: metadata.id.to_string(),
            });
        }
        let id = metadata.id;
        debug!(plugin = %metadata.name, %id, "Plugin registered");
        plugins.push(PluginEntry {
            metadata,
            plugin: Arc::new(Mutex::new(plugin)),
            state: PluginState::Registered,
        });
        Ok(id)
    }

    /// 按注册顺序加载全部插件，返回新加载的数量
    pub fn load_plugins(&self) -> Result<usize> {
        let mut loaded = 0;
        for id in self.plugin_ids() {
            if !self.is_loaded(&id) {
                self.load_plugin(&id)?;
                loaded += 1;
            }
        }
        info!(loaded, "Plugins loaded");
        Ok(loaded)
    }

    /// 加载单个插件，必需依赖先加载
    pub fn load_plugin(&self, id: &PluginId) -> Result<()> {
        let (metadata, plugin) = {
            let mut plugins = self.plugins.lock();
            let entry = Self::find_mut(&mut plugins, id)?;
            match entry.state {
                PluginState::Loaded => return Ok(()),
                PluginState::Loading => {
                    return Err(FoundryError::plugin_load(&format!(
                        "Circular dependency while loading {}",
                        entry.metadata.name
                    )))
                }
                _ => entry.state = PluginState::Loading,
            }
            (entry.metadata.clone(), Arc::clone(&entry.plugin))
        };

        let result = self
            .load_dependencies(&metadata)
            .and_then(|_| plugin.lock().load(&self.services));

        let state = match &result {
            Ok(()) => PluginState::Loaded,
            Err(e) => {
                warn!(plugin = %metadata.name, "Plugin failed to load: {}", e);
                PluginState::Error
            }
        };
        self.set_state(id, state);
        result?;

        info!(plugin = %metadata.name, version = %metadata.version, "Plugin loaded");
        self.plugin_loaded.trigger(metadata);
        Ok(())
    }

    fn load_dependencies(&self, metadata: &PluginMetadata) -> Result<()> {
        for dependency in &metadata.dependencies {
            let version = match self.metadata(&dependency.plugin_id) {
                Ok(found) => found.version,
                Err(_) if dependency.optional => continue,
                Err(e) => return Err(e),
            };
            if !dependency.version_req.matches(&version) {
                if dependency.optional {
                    continue;
                }
                return Err(FoundryError::plugin_load(&format!(
                    "Plugin {} requires {} {}, found {}",
                    metadata.name, dependency.plugin_id, dependency.version_req, version
                )));
            }
            self.load_plugin(&dependency.plugin_id)?;
        }
        Ok(())
    }

    /// 卸载单个插件；仍被已加载插件依赖时失败
    pub fn unload_plugin(&self, id: &PluginId) -> Result<()> {
        let (metadata, plugin) = {
            let mut plugins = self.plugins.lock();
            let dependent = plugins
                .iter()
                .filter(|entry| entry.state == PluginState::Loaded)
                .find(|entry| {
                    entry
                        .metadata
                        .dependencies
                        .iter()
                        .any(|dependency| !dependency.optional && dependency.plugin_id == *id)
                })
                .map(|entry| entry.metadata.name.clone());
            let entry = Self::find_mut(&mut plugins, id)?;
            if entry.state != PluginState::Loaded {
                return Ok(());
            }
            if let Some(dependent) = dependent {
                return Err(FoundryError::plugin_load(&format!(
                    "Plugin {} is still required by {}",
                    entry.metadata.name, dependent
                )));
            }
            entry.state = PluginState::Unloading;
            (entry.metadata.clone(), Arc::clone(&entry.plugin))
        };

        let result = plugin.lock().unload();
        if let Err(e) = &result {
            warn!(plugin = %metadata.name, "Plugin failed to unload cleanly: {}", e);
        }
        self.set_state(id, PluginState::Registered);

        info!(plugin = %metadata.name, "Plugin unloaded");
        self.plugin_unloaded.trigger(metadata);
        result
    }

    /// 卸载全部插件，依赖者先于被依赖者卸载
    pub fn unload_plugins(&self) -> Result<usize> {
        let mut unloaded = 0;
        loop {
            let loaded: Vec<PluginId> = self
                .plugin_ids()
                .into_iter()
                .rev()
                .filter(|id| self.is_loaded(id))
                .collect();
            if loaded.is_empty() {
                return Ok(unloaded);
            }
            let before = unloaded;
            for id in loaded {
                match self.unload_plugin(&id) {
                    Ok(()) => unloaded += 1,
                    Err(FoundryError::PluginLoad { .. }) if self.is_loaded(&id) => continue,
                    Err(e) => return Err(e),
                }
            }
            if unloaded == before {
                return Err(FoundryError::plugin_load("Unable to resolve plugin unload order"));
            }
        }
    }

    /// 按注册顺序列出插件ID
    pub fn plugin_ids(&self) -> Vec<PluginId> {
        self.plugins
            .lock()
            .iter()
            .map(|entry| entry.metadata.id)
            .collect()
    }

    pub fn is_loaded(&self, id: &PluginId) -> bool {
        self.state(id) == Some(PluginState::Loaded)
    }

    pub fn state(&self, id: &PluginId) -> Option<PluginState> {
        self.plugins
            .lock()
            .iter()
            .find(|entry| entry.metadata.id == *id)
            .map(|entry| entry.state)
    }

    pub fn metadata(&self, id: &PluginId) -> Result<PluginMetadata> {
        self.plugins
            .lock()
            .iter()
            .find(|entry| entry.metadata.id == *id)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| FoundryError::PluginNotFound {
                plugin_id: id.to_string(),
            })
    }

    fn find_mut<'a>(plugins: &'a mut [PluginEntry], id: &PluginId) -> Result<&'a mut PluginEntry> {
        plugins
            .iter_mut()
            .find(|entry| entry.metadata.id == *id)
            .ok_or_else(|| FoundryError::PluginNotFound {
                plugin_id: id.to_string(),
            })
    }

    fn set_state(&self, id: &PluginId, state: PluginState) {
        if let Some(entry) = self
            .plugins
            .lock()
            .iter_mut()
            .find(|entry| entry.metadata.id == *id)
        {
            entry.state = state;
        }
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("framework_version", &self.framework_version)
            .field("plugins", &self.plugins.lock().len())
            .finish()
    }
}
