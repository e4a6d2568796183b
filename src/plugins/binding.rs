//! 插件绑定
//!
//! 脚本侧持有的插件函数句柄。绑定本身在插件卸载后继续存在，只是入口被
//! 清空；同名插件重新加载时入口被重新填上。

use super::inflight::InFlight;
use super::{PluginContext, PluginFn};
use crate::access::Value;
use crate::core::error::{BridgeResult, InvocationError, UnloadedError};
use crate::core::runtime::Runtime;
use crate::core::utils::panic_message;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

/// 绑定种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Command,
    Function,
}

/// 指向插件导出函数的绑定
pub struct PluginBinding {
    pub plugin: String,
    pub name: String,
    pub kind: BindingKind,
    entry: RwLock<Option<Arc<PluginFn>>>,
    inflight: Arc<InFlight>,
}

impl fmt::Debug for PluginBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginBinding")
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl PluginBinding {
    pub fn new(plugin: &str, name: &str, kind: BindingKind, inflight: Arc<InFlight>) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: name.to_string(),
            kind,
            entry: RwLock::new(None),
            inflight,
        }
    }

    fn unloaded(&self) -> UnloadedError {
        UnloadedError {
            plugin: self.plugin.clone(),
            function: self.name.clone(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 填入入口；只在挂起锁下由管理器调用
    pub(crate) fn attach(&self, body: Arc<PluginFn>) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(body);
    }

    /// 清空入口；只在挂起锁下由管理器调用
    pub(crate) fn detach(&self) {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 调用插件函数
    ///
    /// 先登记在途调用再取入口：卸载在计数归零之前不会清空入口，
    /// 所以取到的入口在凭证存活期间都有效。
    pub fn call(&self, runtime: &Runtime, args: &[Value]) -> BridgeResult<Value> {
        let _guard = self.inflight.enter().ok_or_else(|| self.unloaded())?;
        let body = self
            .entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.unloaded())?;

        let ctx = PluginContext::new(runtime, &self.plugin);
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&ctx, args)));
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(InvocationError::Plugin {
                plugin: self.plugin.clone(),
                function: self.name.clone(),
                source: Box::new(err),
            }
            .into()),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    target: "plugin",
                    "{}.{} panicked: {}",
                    self.plugin,
                    self.name,
                    message
                );
                Err(InvocationError::Panicked {
                    function: format!("{}.{}", self.plugin, self.name),
                    message,
                }
                .into())
            }
        }
    }
}
