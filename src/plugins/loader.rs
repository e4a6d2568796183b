//! 插件加载器
//!
//! - [`StaticLoader`]: 进程内注册的工厂函数
//! - [`LibraryLoader`]: 从插件目录加载动态库，库必须导出
//!   [`PLUGIN_ENTRY_SYMBOL`]，通常由 [`declare_plugin!`](crate::declare_plugin) 生成

use super::{PluginError, PluginModule, PluginResult};
use libloading::{Library, Symbol};
use std::collections::BTreeMap;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// 动态库导出的构造函数名
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"struct_bridge_plugin_create";

/// 动态库构造函数的签名
pub type PluginCreate = unsafe extern "C" fn() -> *mut Box<dyn PluginModule>;

/// 加载结果
///
/// 字段按声明顺序析构：模块先于库释放。
pub struct LoadedModule {
    pub module: Arc<dyn PluginModule>,
    pub library: Option<Library>,
    pub path: Option<PathBuf>,
}

impl LoadedModule {
    pub fn in_process(module: Arc<dyn PluginModule>) -> Self {
        Self {
            module,
            library: None,
            path: None,
        }
    }
}

/// 按名字提供插件模块
pub trait PluginLoader: Send + Sync {
    fn can_load(&self, name: &str) -> bool;

    fn load(&self, name: &str) -> PluginResult<LoadedModule>;

    /// 可加载的插件名
    fn available(&self) -> Vec<String>;

    /// 插件对应的文件，供热重载匹配
    fn source_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

// ============================================================================
// 进程内加载器
// ============================================================================

type Factory = dyn Fn() -> Box<dyn PluginModule> + Send + Sync;

/// 进程内工厂加载器
#[derive(Default)]
pub struct StaticLoader {
    factories: RwLock<BTreeMap<String, Arc<Factory>>>,
    /// 模拟的源文件位置，测试热重载时使用
    paths: RwLock<BTreeMap<String, PathBuf>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn with<F>(self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PluginModule> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// 把插件关联到一个文件路径
    pub fn with_source(self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), path.into());
        self
    }
}

impl PluginLoader for StaticLoader {
    fn can_load(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn load(&self, name: &str) -> PluginResult<LoadedModule> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let module: Arc<dyn PluginModule> = Arc::from(factory());
        let mut loaded = LoadedModule::in_process(module);
        loaded.path = self.source_path(name);
        Ok(loaded)
    }

    fn available(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn source_path(&self, name: &str) -> Option<PathBuf> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

// ============================================================================
// 动态库加载器
// ============================================================================

/// 插件目录中的动态库加载器
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    directory: PathBuf,
}

impl LibraryLoader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// 插件名对应的库文件
    pub fn library_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}{}", DLL_PREFIX, name, DLL_SUFFIX))
    }

    /// 从库文件名取插件名
    pub fn plugin_name(path: &Path) -> Option<String> {
        let file = path.file_name()?.to_str()?;
        let stem = file.strip_suffix(DLL_SUFFIX)?;
        let name = stem.strip_prefix(DLL_PREFIX).unwrap_or(stem);
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

impl PluginLoader for LibraryLoader {
    fn can_load(&self, name: &str) -> bool {
        self.library_path(name).is_file()
    }

    fn load(&self, name: &str) -> PluginResult<LoadedModule> {
        let path = self.library_path(name);
        if !path.is_file() {
            return Err(PluginError::NotFound(name.to_string()));
        }

        // SAFETY: 插件库由宿主信任；构造函数按 `declare_plugin!` 的约定返回
        // `Box::into_raw` 得到的指针，所有权在这里收回
        let module = unsafe {
            let library = Library::new(&path).map_err(|e| {
                PluginError::LoadError(format!("{}: {}", path.display(), e))
            })?;
            let boxed = {
                let create: Symbol<PluginCreate> = library
                    .get(PLUGIN_ENTRY_SYMBOL)
                    .map_err(|e| PluginError::SymbolError(e.to_string()))?;
                let raw = create();
                if raw.is_null() {
                    return Err(PluginError::LoadError(format!(
                        "{}: plugin constructor returned null",
                        path.display()
                    )));
                }
                *Box::from_raw(raw)
            };
            LoadedModule {
                module: Arc::from(boxed),
                library: Some(library),
                path: Some(path.clone()),
            }
        };

        if module.module.name() != name {
            return Err(PluginError::LoadError(format!(
                "{} declares plugin {}, expected {}",
                path.display(),
                module.module.name(),
                name
            )));
        }
        tracing::debug!(target: "plugin", "Loaded library {}", path.display());
        Ok(module)
    }

    fn available(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.directory) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter_map(|path| Self::plugin_name(&path))
            .collect();
        names.sort();
        names
    }

    fn source_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.library_path(name))
    }
}
