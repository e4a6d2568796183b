//! 运行时上下文
//!
//! [`Runtime`] 持有桥接层的全部共享状态：类型注册表、绑定缓存、宿主
//! 内存、挂起锁、全局符号表、插件管理器和持久化存储。启动时构造一次，
//! 以引用形式传给每个入口，关闭时统一拆除。
//!
//! # 示例
//!
//! ```
//! use struct_bridge::core::runtime::Runtime;
//! use struct_bridge::types::{FieldDescriptor, PrimitiveKind, StructIdentity, TypeRegistry, TypeShape};
//!
//! let mut builder = TypeRegistry::builder();
//! let i32_t = builder.primitive(PrimitiveKind::I32);
//! let unit = builder.add(
//!     "unit",
//!     TypeShape::Struct(StructIdentity::new(4, vec![FieldDescriptor::primitive("hp", 0, i32_t)])),
//! );
//! let runtime = Runtime::builder()
//!     .types(builder.build().unwrap())
//!     .build()
//!     .unwrap();
//! assert_eq!(runtime.types().byte_size(unit), Some(4));
//! ```

use crate::access::AccessContext;
use crate::binding::BindingCache;
use crate::config::BridgeConfig;
use crate::core::error::{AccessError, BridgeResult};
use crate::core::interrupt::InterruptFlag;
use crate::core::suspend::SuspendLock;
use crate::memory::{Address, ArenaMemory, HostMemory};
use crate::plugins::{PluginLoader, PluginManager};
use crate::scripting::persistent::PersistentStore;
use crate::types::TypeRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// 全局符号表：全局变量名到宿主地址
#[derive(Debug, Default)]
pub struct GlobalSymbols {
    symbols: RwLock<HashMap<String, Address>>,
}

impl GlobalSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: &str, address: Address) {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), address);
    }

    pub fn remove(&self, name: &str) -> Option<Address> {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.symbols
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// 解析全局地址，未知时返回 [`AccessError::UnknownGlobal`]
    pub fn resolve(&self, name: &str) -> Result<Address, AccessError> {
        self.lookup(name)
            .ok_or_else(|| AccessError::UnknownGlobal(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}

/// 桥接层运行时
pub struct Runtime {
    config: BridgeConfig,
    types: TypeRegistry,
    bindings: BindingCache,
    memory: Mutex<Box<dyn HostMemory>>,
    suspend: SuspendLock,
    interrupt: InterruptFlag,
    globals: GlobalSymbols,
    plugins: PluginManager,
    persistent: Mutex<PersistentStore>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("types", &self.types.len())
            .field("bindings", &self.bindings.len())
            .field("plugins", &self.plugins.names())
            .finish()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn bindings(&self) -> &BindingCache {
        &self.bindings
    }

    pub fn suspend(&self) -> &SuspendLock {
        &self.suspend
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn globals(&self) -> &GlobalSymbols {
        &self.globals
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn persistent(&self) -> MutexGuard<'_, PersistentStore> {
        self.persistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 在挂起锁和内存锁下访问宿主对象
    ///
    /// 挂起锁可重入；内存锁不可重入，`f` 内不能再次调用本方法。
    /// 原生函数应在 `f` 返回后再调用。
    pub fn with_access<R>(&self, f: impl FnOnce(&mut AccessContext<'_>) -> R) -> R {
        let _held = self.suspend.lock();
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ctx = AccessContext {
            types: &self.types,
            bindings: &self.bindings,
            mem: &mut **memory,
            globals: &self.globals,
        };
        f(&mut ctx)
    }

    /// 关闭：卸载全部插件并保存持久化数据
    pub fn shutdown(&self) -> BridgeResult<()> {
        tracing::info!(target: "bridge", "Runtime shutting down");
        self.plugins.unload_all(self)?;
        if let Some(path) = &self.config.persistence.path {
            self.persistent().save(path)?;
        }
        Ok(())
    }
}

/// 运行时构建器
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Option<BridgeConfig>,
    types: Option<TypeRegistry>,
    memory: Option<Box<dyn HostMemory>>,
    globals: Vec<(String, Address)>,
    loaders: Vec<Box<dyn PluginLoader>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn types(mut self, types: TypeRegistry) -> Self {
        self.types = Some(types);
        self
    }

    pub fn memory(mut self, memory: Box<dyn HostMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn global(mut self, name: &str, address: Address) -> Self {
        self.globals.push((name.to_string(), address));
        self
    }

    pub fn loader(mut self, loader: Box<dyn PluginLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn build(self) -> BridgeResult<Arc<Runtime>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let persistent = match &config.persistence.path {
            Some(path) if path.exists() => PersistentStore::load(path)?,
            _ => PersistentStore::new(),
        };

        let globals = GlobalSymbols::new();
        for (name, address) in &self.globals {
            globals.define(name, *address);
        }

        let plugins = PluginManager::new();
        for loader in self.loaders {
            plugins.add_loader(loader);
        }

        let runtime = Runtime {
            types: self.types.unwrap_or_default(),
            bindings: BindingCache::new(),
            memory: Mutex::new(
                self.memory
                    .unwrap_or_else(|| Box::new(ArenaMemory::new())),
            ),
            suspend: SuspendLock::new(),
            interrupt: InterruptFlag::new(),
            globals,
            plugins,
            persistent: Mutex::new(persistent),
            config,
        };
        tracing::info!(
            target: "bridge",
            "Runtime ready: {} type identities",
            runtime.types.len()
        );
        Ok(Arc::new(runtime))
    }
}
