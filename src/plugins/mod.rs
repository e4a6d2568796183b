//! 插件系统
//!
//! 插件是一组命名的原生入口：命令（经命令表按名分派）、函数（脚本侧
//! 以 `host.plugins.<插件>.<函数>` 调用）和事件（插件发出、脚本监听）。
//! 插件可以在宿主进程运行期间卸载和重新加载：
//!
//! - 每个插件有一个在途调用计数 [`InFlight`]，进入调用前加一，退出后减一
//! - 卸载先请求插件收尾，再等待计数归零，最后在挂起锁下清空所有绑定入口
//! - 卸载后仍被持有的绑定返回 [`UnloadedError`](crate::core::error::UnloadedError)
//!   而不会调用已释放的代码；重新加载后同名绑定恢复可用

pub mod binding;
pub mod config;
pub mod hot_reload;
pub mod inflight;
pub mod loader;
pub mod manager;

pub use binding::{BindingKind, PluginBinding};
pub use config::{PluginConfig, PluginConfigManager};
pub use hot_reload::HotReloadManager;
pub use inflight::{InFlight, InFlightGuard};
pub use loader::{LibraryLoader, LoadedModule, PluginLoader, StaticLoader, PLUGIN_ENTRY_SYMBOL};
pub use manager::PluginManager;

use crate::access::Value;
use crate::core::error::BridgeResult;
use crate::core::runtime::Runtime;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// 插件错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin is not loaded: {0}")]
    NotLoaded(String),

    #[error("Plugin {plugin} requires global {global}, which is not known")]
    MissingGlobal { plugin: String, global: String },

    #[error("Plugin {plugin}: command {command} is already provided by {owner}")]
    CommandConflict {
        plugin: String,
        command: String,
        owner: String,
    },

    #[error("Plugin {plugin} failed to initialize: {message}")]
    InitFailed { plugin: String, message: String },

    #[error("Failed to load library: {0}")]
    LoadError(String),

    #[error("Failed to get plugin symbol: {0}")]
    SymbolError(String),

    #[error("No loader can provide plugin {0}")]
    NoLoader(String),

    #[error("File system error: {0}")]
    FileSystemError(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Plugin {plugin} does not declare event {event}")]
    UnknownEvent { plugin: String, event: String },
}

pub type PluginResult<T> = Result<T, PluginError>;

/// 插件版本信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PluginVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PluginVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 插件生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    /// 加载失败，没有注册任何东西
    Broken,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Unloading => "unloading",
            PluginState::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// 宿主状态变化，广播给所有已加载插件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    SimulationLoaded,
    SimulationUnloaded,
    Paused,
    Unpaused,
}

/// 发给订阅者的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginNotification {
    Loaded(String),
    Unloaded(String),
    Reloaded(String),
    Broken { name: String, reason: String },
    StateChanged { name: String, change: StateChange },
}

/// 插件发出的事件，由脚本桥在持锁状态下投递给监听者
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEvent {
    pub plugin: String,
    pub name: String,
    pub args: Vec<Value>,
}

/// 插件导出的函数体
pub type PluginFn = dyn Fn(&PluginContext<'_>, &[Value]) -> BridgeResult<Value> + Send + Sync;

/// 一个命名导出
#[derive(Clone)]
pub struct ExportedFn {
    pub name: String,
    pub body: Arc<PluginFn>,
}

impl fmt::Debug for ExportedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedFn").field("name", &self.name).finish()
    }
}

/// 插件的导出表
#[derive(Debug, Clone, Default)]
pub struct PluginExports {
    pub commands: Vec<ExportedFn>,
    pub functions: Vec<ExportedFn>,
    pub events: Vec<String>,
}

impl PluginExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&PluginContext<'_>, &[Value]) -> BridgeResult<Value> + Send + Sync + 'static,
    {
        self.commands.push(ExportedFn {
            name: name.to_string(),
            body: Arc::new(body),
        });
        self
    }

    pub fn function<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&PluginContext<'_>, &[Value]) -> BridgeResult<Value> + Send + Sync + 'static,
    {
        self.functions.push(ExportedFn {
            name: name.to_string(),
            body: Arc::new(body),
        });
        self
    }

    pub fn event(mut self, name: &str) -> Self {
        self.events.push(name.to_string());
        self
    }
}

/// 插件调用时可见的上下文
pub struct PluginContext<'a> {
    runtime: &'a Runtime,
    plugin: &'a str,
}

impl<'a> PluginContext<'a> {
    pub fn new(runtime: &'a Runtime, plugin: &'a str) -> Self {
        Self { runtime, plugin }
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn plugin_name(&self) -> &'a str {
        self.plugin
    }

    /// 发出事件；事件必须在导出表中声明过
    pub fn emit(&self, event: &str, args: Vec<Value>) -> PluginResult<()> {
        self.runtime.plugins().emit(self.plugin, event, args)
    }

    /// 读取插件配置中的参数
    pub fn parameter(&self, key: &str) -> Option<String> {
        self.runtime.plugins().parameter(self.plugin, key)
    }
}

/// 插件模块
///
/// 除 `name` 和 `exports` 外都有默认实现。
pub trait PluginModule: Send + Sync {
    /// 插件名称
    fn name(&self) -> &str;

    /// 插件版本
    fn version(&self) -> PluginVersion {
        PluginVersion::new(1, 0, 0)
    }

    /// 加载前必须能解析的全局符号
    fn required_globals(&self) -> Vec<String> {
        Vec::new()
    }

    /// 导出的命令、函数与事件
    fn exports(&self) -> PluginExports;

    /// 加载阶段，失败时插件进入 `Broken`
    fn init(&self, _ctx: &PluginContext<'_>) -> BridgeResult<()> {
        Ok(())
    }

    /// 卸载前的收尾请求，此时可能仍有在途调用
    fn shutdown(&self, _ctx: &PluginContext<'_>) -> BridgeResult<()> {
        Ok(())
    }

    /// 供控制台显示的状态文本
    fn status(&self) -> String {
        String::new()
    }

    /// 每帧调用
    fn on_update(&self, _ctx: &PluginContext<'_>) -> BridgeResult<()> {
        Ok(())
    }

    fn on_state_change(&self, _ctx: &PluginContext<'_>, _change: StateChange) -> BridgeResult<()> {
        Ok(())
    }
}
