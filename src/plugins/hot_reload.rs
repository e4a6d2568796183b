//! 插件热重载
//!
//! 文件监视器把插件目录中被修改的库文件排入队列，宿主在合适的时机
//! （通常是每帧一次，且不持有挂起锁）调用 [`HotReloadManager::check_and_reload`]，
//! 对内容确实变化了的已加载插件执行卸载和重新加载。

use super::loader::LibraryLoader;
use super::{PluginError, PluginResult};
use crate::core::runtime::Runtime;
use crate::core::utils::file_fingerprint;
use crossbeam_channel::{unbounded, Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::env::consts::DLL_SUFFIX;
use std::path::{Path, PathBuf};

/// 热重载管理器
pub struct HotReloadManager {
    directory: PathBuf,
    watcher: Option<RecommendedWatcher>,
    queue_tx: Sender<PathBuf>,
    queue_rx: Receiver<PathBuf>,
    /// 上一次加载时的文件指纹
    fingerprints: HashMap<PathBuf, String>,
    enabled: bool,
}

impl HotReloadManager {
    /// 创建管理器并开始监视插件目录
    pub fn new(directory: impl Into<PathBuf>) -> PluginResult<Self> {
        let mut manager = Self::unwatched(directory)?;
        let tx = manager.queue_tx.clone();
        let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            let Ok(event) = result else {
                return;
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            for path in event.paths {
                if is_library(&path) {
                    let _ = tx.send(path);
                }
            }
        })
        .map_err(|e| PluginError::FileSystemError(e.to_string()))?;

        watcher
            .watch(&manager.directory, RecursiveMode::NonRecursive)
            .map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        manager.watcher = Some(watcher);
        tracing::info!(
            target: "plugin",
            "Watching {} for plugin changes",
            manager.directory.display()
        );
        Ok(manager)
    }

    /// 不启动监视器，只接受手动排队的变化
    pub fn unwatched(directory: impl Into<PathBuf>) -> PluginResult<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)
            .map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        let (queue_tx, queue_rx) = unbounded();
        Ok(Self {
            directory,
            watcher: None,
            queue_tx,
            queue_rx,
            fingerprints: HashMap::new(),
            enabled: true,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// 手动排入一个变化的文件
    pub fn queue(&self, path: impl Into<PathBuf>) {
        let _ = self.queue_tx.send(path.into());
    }

    /// 记录插件当前的文件指纹，之后只有内容变化才会触发重载
    pub fn track(&mut self, runtime: &Runtime, plugin: &str) {
        let Some(path) = runtime.plugins().source_path(plugin) else {
            return;
        };
        if let Ok(fingerprint) = file_fingerprint(&path) {
            self.fingerprints.insert(path, fingerprint);
        }
    }

    /// 处理排队的变化，返回成功重载的插件名
    ///
    /// 调用线程不能持有挂起锁。
    pub fn check_and_reload(&mut self, runtime: &Runtime) -> Vec<String> {
        let pending: BTreeSet<PathBuf> = self.queue_rx.try_iter().collect();
        if !self.enabled {
            return Vec::new();
        }

        let mut reloaded = Vec::new();
        for path in pending {
            let plugins = runtime.plugins();
            let Some(name) = plugins
                .plugin_for_path(&path)
                .or_else(|| LibraryLoader::plugin_name(&path))
            else {
                continue;
            };
            if !plugins.is_loaded(&name) {
                continue;
            }

            // 编辑器和链接器常常连续写几次，内容没变时跳过
            let Ok(fingerprint) = file_fingerprint(&path) else {
                continue;
            };
            if self.fingerprints.get(&path) == Some(&fingerprint) {
                continue;
            }

            match plugins.reload(runtime, &name) {
                Ok(()) => {
                    tracing::info!(target: "plugin", "Reloaded plugin {}", name);
                    self.fingerprints.insert(path, fingerprint);
                    reloaded.push(name);
                }
                Err(e) => {
                    tracing::error!(target: "plugin", "Failed to reload plugin {}: {}", name, e);
                }
            }
        }
        reloaded
    }
}

fn is_library(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(DLL_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_library() {
        let lib = PathBuf::from(format!("plugins/libsensor{}", DLL_SUFFIX));
        assert!(is_library(&lib));
        assert!(!is_library(Path::new("plugins/sensor.txt")));
    }

    #[test]
    fn test_unknown_paths_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::builder().build().unwrap();
        let mut hot = HotReloadManager::unwatched(dir.path()).unwrap();
        assert!(!hot.is_watching());
        hot.queue(dir.path().join("notes.txt"));
        assert!(hot.check_and_reload(&runtime).is_empty());
    }
}
