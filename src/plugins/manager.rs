//! 插件管理器
//!
//! 管理器拥有插件表、绑定表、命令表和事件队列。加载和卸载遵循固定顺序：
//!
//! 加载：找到加载器 → 检查全局符号 → 检查命令冲突 → `init` →
//! 持挂起锁登记命令与绑定 → `Loaded`。任何一步失败插件都进入 `Broken`，
//! 不登记任何东西。
//!
//! 卸载：`Unloading` → 拒绝新调用 → `shutdown` → 在挂起锁之外等待在途调用
//! 归零 → 持挂起锁清空绑定入口并移除命令 → 释放模块，再释放库 → `Unloaded`。

use super::binding::{BindingKind, PluginBinding};
use super::config::PluginConfigManager;
use super::inflight::InFlight;
use super::loader::{LoadedModule, PluginLoader};
use super::{
    ExportedFn, PluginContext, PluginError, PluginEvent, PluginModule, PluginNotification,
    PluginResult, PluginState, StateChange,
};
use crate::access::Value;
use crate::core::error::{BridgeError, BridgeResult};
use crate::core::runtime::Runtime;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// 单个插件的登记项；卸载后保留，以便重新加载时沿用计数和绑定
struct PluginSlot {
    state: PluginState,
    inflight: Arc<InFlight>,
    loaded: Option<LoadedModule>,
    source: Option<PathBuf>,
    functions: Vec<String>,
    commands: Vec<String>,
    events: Vec<String>,
}

impl PluginSlot {
    fn new() -> Self {
        Self {
            state: PluginState::Unloaded,
            inflight: InFlight::new(),
            loaded: None,
            source: None,
            functions: Vec::new(),
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    fn module(&self) -> Option<Arc<dyn PluginModule>> {
        self.loaded.as_ref().map(|l| Arc::clone(&l.module))
    }
}

type BindingTable = HashMap<(String, String), Arc<PluginBinding>>;

/// 插件管理器
pub struct PluginManager {
    loaders: RwLock<Vec<Box<dyn PluginLoader>>>,
    plugins: Mutex<BTreeMap<String, PluginSlot>>,
    bindings: RwLock<BindingTable>,
    /// 命令名到所属插件
    commands: Mutex<HashMap<String, String>>,
    settings: RwLock<PluginConfigManager>,
    events_tx: Sender<PluginEvent>,
    events_rx: Receiver<PluginEvent>,
    subscribers: Mutex<Vec<Sender<PluginNotification>>>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            loaders: RwLock::new(Vec::new()),
            plugins: Mutex::new(BTreeMap::new()),
            bindings: RwLock::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
            settings: RwLock::new(PluginConfigManager::new()),
            events_tx,
            events_rx,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn plugins(&self) -> MutexGuard<'_, BTreeMap<String, PluginSlot>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_loader(&self, loader: Box<dyn PluginLoader>) {
        self.loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(loader);
    }

    pub fn set_settings(&self, settings: PluginConfigManager) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn parameter(&self, plugin: &str, key: &str) -> Option<String> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .parameter(plugin, key)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 登记过的插件名（包括已卸载和损坏的）
    pub fn names(&self) -> Vec<String> {
        self.plugins().keys().cloned().collect()
    }

    /// 所有加载器能提供的插件名
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|loader| loader.available())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.plugins().get(name).map(|slot| slot.state)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state(name) == Some(PluginState::Loaded)
    }

    /// 插件的源文件
    pub fn source_path(&self, name: &str) -> Option<PathBuf> {
        self.plugins().get(name).and_then(|slot| slot.source.clone())
    }

    /// 源文件为 `path` 的插件
    pub fn plugin_for_path(&self, path: &Path) -> Option<String> {
        self.plugins()
            .iter()
            .find(|(_, slot)| slot.source.as_deref() == Some(path))
            .map(|(name, _)| name.clone())
    }

    /// 插件导出的函数名
    pub fn functions(&self, plugin: &str) -> Vec<String> {
        self.plugins()
            .get(plugin)
            .map(|slot| slot.functions.clone())
            .unwrap_or_default()
    }

    /// 全部命令及其所属插件，按名字排序
    pub fn commands(&self) -> Vec<(String, String)> {
        let mut commands: Vec<(String, String)> = self
            .command_table()
            .iter()
            .map(|(cmd, owner)| (cmd.clone(), owner.clone()))
            .collect();
        commands.sort();
        commands
    }

    /// 插件函数的绑定；插件卸载后绑定仍然存在
    pub fn binding(&self, plugin: &str, function: &str) -> Option<Arc<PluginBinding>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(plugin.to_string(), function.to_string()))
            .cloned()
    }

    /// 插件的状态文本
    pub fn status(&self, name: &str) -> Option<String> {
        let (module, inflight) = {
            let plugins = self.plugins();
            let slot = plugins.get(name)?;
            (slot.module(), Arc::clone(&slot.inflight))
        };
        let state = self.state(name)?;
        match (module, inflight.enter()) {
            (Some(module), Some(_guard)) => {
                let text = module.status();
                if text.is_empty() {
                    Some(state.to_string())
                } else {
                    Some(format!("{}: {}", state, text))
                }
            }
            _ => Some(state.to_string()),
        }
    }

    // ========================================================================
    // 通知与事件
    // ========================================================================

    /// 订阅生命周期通知
    pub fn subscribe(&self) -> Receiver<PluginNotification> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, notification: PluginNotification) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// 排队一个事件；插件必须声明过该事件
    pub fn emit(&self, plugin: &str, event: &str, args: Vec<Value>) -> PluginResult<()> {
        let declared = self
            .plugins()
            .get(plugin)
            .map_or(false, |slot| slot.events.iter().any(|e| e == event));
        if !declared {
            return Err(PluginError::UnknownEvent {
                plugin: plugin.to_string(),
                event: event.to_string(),
            });
        }
        // 接收端由管理器持有，发送不会失败
        let _ = self.events_tx.send(PluginEvent {
            plugin: plugin.to_string(),
            name: event.to_string(),
            args,
        });
        Ok(())
    }

    /// 取出所有排队的事件
    pub fn drain_events(&self) -> Vec<PluginEvent> {
        self.events_rx.try_iter().collect()
    }

    // ========================================================================
    // 加载
    // ========================================================================

    /// 加载插件
    pub fn load(&self, runtime: &Runtime, name: &str) -> PluginResult<()> {
        {
            let mut plugins = self.plugins();
            let slot = plugins
                .entry(name.to_string())
                .or_insert_with(PluginSlot::new);
            match slot.state {
                PluginState::Unloaded | PluginState::Broken => slot.state = PluginState::Loading,
                _ => return Err(PluginError::AlreadyLoaded(name.to_string())),
            }
        }

        match self.try_load(runtime, name) {
            Ok(()) => {
                tracing::info!(target: "plugin", "Loaded plugin {}", name);
                self.notify(PluginNotification::Loaded(name.to_string()));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(target: "plugin", "Plugin {} is broken: {}", name, err);
                if let Some(slot) = self.plugins().get_mut(name) {
                    slot.state = PluginState::Broken;
                    slot.events.clear();
                }
                self.notify(PluginNotification::Broken {
                    name: name.to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn try_load(&self, runtime: &Runtime, name: &str) -> PluginResult<()> {
        let loaded = {
            let loaders = self.loaders.read().unwrap_or_else(PoisonError::into_inner);
            let loader = loaders
                .iter()
                .find(|loader| loader.can_load(name))
                .ok_or_else(|| PluginError::NoLoader(name.to_string()))?;
            loader.load(name)?
        };
        let module = Arc::clone(&loaded.module);

        for global in module.required_globals() {
            if !runtime.globals().contains(&global) {
                return Err(PluginError::MissingGlobal {
                    plugin: name.to_string(),
                    global,
                });
            }
        }

        // 导出表中的闭包可能来自插件库，必须先于 `loaded` 释放
        let exports = module.exports();
        {
            let commands = self.command_table();
            for command in &exports.commands {
                if let Some(owner) = commands.get(&command.name) {
                    if owner != name {
                        return Err(PluginError::CommandConflict {
                            plugin: name.to_string(),
                            command: command.name.clone(),
                            owner: owner.clone(),
                        });
                    }
                }
            }
        }

        let events = exports.events.clone();
        self.set_events(name, events);
        let ctx = PluginContext::new(runtime, name);
        module.init(&ctx).map_err(|e| PluginError::InitFailed {
            plugin: name.to_string(),
            message: e.to_string(),
        })?;
        drop(module);

        let _held = runtime.suspend().lock();
        let inflight = {
            let plugins = self.plugins();
            plugins
                .get(name)
                .map(|slot| Arc::clone(&slot.inflight))
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?
        };
        {
            let mut commands = self.command_table();
            for command in &exports.commands {
                commands.insert(command.name.clone(), name.to_string());
            }
        }
        self.attach_all(name, &inflight, BindingKind::Command, &exports.commands);
        self.attach_all(name, &inflight, BindingKind::Function, &exports.functions);

        let mut plugins = self.plugins();
        let slot = plugins
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        slot.functions = exports.functions.iter().map(|f| f.name.clone()).collect();
        slot.commands = exports.commands.iter().map(|c| c.name.clone()).collect();
        slot.source = loaded.path.clone();
        slot.loaded = Some(loaded);
        slot.state = PluginState::Loaded;
        inflight.reopen();
        Ok(())
    }

    fn set_events(&self, name: &str, events: Vec<String>) {
        if let Some(slot) = self.plugins().get_mut(name) {
            slot.events = events;
        }
    }

    fn attach_all(
        &self,
        plugin: &str,
        inflight: &Arc<InFlight>,
        kind: BindingKind,
        exported: &[ExportedFn],
    ) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        for export in exported {
            let binding = bindings
                .entry((plugin.to_string(), export.name.clone()))
                .or_insert_with(|| {
                    Arc::new(PluginBinding::new(
                        plugin,
                        &export.name,
                        kind,
                        Arc::clone(inflight),
                    ))
                });
            binding.attach(Arc::clone(&export.body));
        }
    }

    /// 按配置的优先级加载一组插件，跳过禁用的插件；返回失败项
    pub fn autoload(&self, runtime: &Runtime, names: &[String]) -> Vec<(String, PluginError)> {
        let order = self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .load_order(names);
        order
            .into_iter()
            .filter_map(|name| self.load(runtime, &name).err().map(|e| (name, e)))
            .collect()
    }

    // ========================================================================
    // 卸载
    // ========================================================================

    /// 卸载插件，阻塞到所有在途调用结束
    ///
    /// 调用线程不能持有挂起锁，否则等待中的调用可能无法完成。
    pub fn unload(&self, runtime: &Runtime, name: &str) -> PluginResult<()> {
        let (module, inflight) = {
            let mut plugins = self.plugins();
            let slot = plugins
                .get_mut(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            if slot.state != PluginState::Loaded {
                return Err(PluginError::NotLoaded(name.to_string()));
            }
            slot.state = PluginState::Unloading;
            (slot.module(), Arc::clone(&slot.inflight))
        };

        inflight.close();
        if let Some(module) = module {
            let ctx = PluginContext::new(runtime, name);
            if let Err(e) = module.shutdown(&ctx) {
                tracing::warn!(target: "plugin", "Plugin {} shutdown failed: {}", name, e);
            }
        }
        inflight.wait_idle();

        let loaded = {
            let _held = runtime.suspend().lock();
            {
                let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
                for ((plugin, _), binding) in bindings.iter() {
                    if plugin == name {
                        binding.detach();
                    }
                }
            }
            self.command_table().retain(|_, owner| owner != name);

            let mut plugins = self.plugins();
            plugins.get_mut(name).and_then(|slot| {
                slot.state = PluginState::Unloaded;
                slot.commands.clear();
                slot.events.clear();
                slot.loaded.take()
            })
        };
        drop(loaded);

        tracing::info!(target: "plugin", "Unloaded plugin {}", name);
        self.notify(PluginNotification::Unloaded(name.to_string()));
        Ok(())
    }

    /// 卸载后重新加载；同名绑定恢复可用
    pub fn reload(&self, runtime: &Runtime, name: &str) -> PluginResult<()> {
        if self.is_loaded(name) {
            self.unload(runtime, name)?;
        }
        self.load(runtime, name)?;
        self.notify(PluginNotification::Reloaded(name.to_string()));
        Ok(())
    }

    /// 卸载全部已加载插件，返回遇到的第一个错误
    pub fn unload_all(&self, runtime: &Runtime) -> BridgeResult<()> {
        let loaded: Vec<String> = self
            .plugins()
            .iter()
            .filter(|(_, slot)| slot.state == PluginState::Loaded)
            .map(|(name, _)| name.clone())
            .collect();
        let mut first_error = None;
        for name in loaded.iter().rev() {
            if let Err(e) = self.unload(runtime, name) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(BridgeError::from(e)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // 分派
    // ========================================================================

    /// 按命令表执行命令
    pub fn run_command(&self, runtime: &Runtime, command: &str, args: &[Value]) -> BridgeResult<Value> {
        let owner = self
            .command_table()
            .get(command)
            .cloned()
            .ok_or_else(|| PluginError::UnknownCommand(command.to_string()))?;
        let binding = self
            .binding(&owner, command)
            .ok_or_else(|| PluginError::UnknownCommand(command.to_string()))?;
        binding.call(runtime, args)
    }

    fn loaded_modules(&self) -> Vec<(String, Arc<dyn PluginModule>, Arc<InFlight>)> {
        self.plugins()
            .iter()
            .filter(|(_, slot)| slot.state == PluginState::Loaded)
            .filter_map(|(name, slot)| {
                slot.module()
                    .map(|m| (name.clone(), m, Arc::clone(&slot.inflight)))
            })
            .collect()
    }

    /// 每帧更新：依次调用各插件的 `on_update`
    pub fn update_all(&self, runtime: &Runtime) {
        for (name, module, inflight) in self.loaded_modules() {
            let Some(_guard) = inflight.enter() else {
                continue;
            };
            let ctx = PluginContext::new(runtime, &name);
            if let Err(e) = module.on_update(&ctx) {
                tracing::warn!(target: "plugin", "{}.on_update: {}", name, e);
            }
        }
    }

    /// 广播宿主状态变化
    pub fn broadcast_state_change(&self, runtime: &Runtime, change: StateChange) {
        for (name, module, inflight) in self.loaded_modules() {
            let Some(_guard) = inflight.enter() else {
                continue;
            };
            let ctx = PluginContext::new(runtime, &name);
            if let Err(e) = module.on_state_change(&ctx, change) {
                tracing::warn!(target: "plugin", "{}.on_state_change: {}", name, e);
            }
            self.notify(PluginNotification::StateChanged { name, change });
        }
    }
}
