//! 插件配置
//!
//! 每个插件一条配置：是否启用、自动加载的优先级和传给插件的参数。
//! 配置文件是 JSON 数组。

use super::{PluginError, PluginResult};
use crate::impl_default;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 单个插件的配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    pub enabled: bool,
    /// 插件参数，插件经 `PluginContext::parameter` 读取
    pub parameters: HashMap<String, String>,
    /// 自动加载顺序（数字越小越先加载）
    pub priority: u32,
}

impl_default!(PluginConfig {
    name: String::new(),
    enabled: true,
    parameters: HashMap::new(),
    priority: 100,
});

impl PluginConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// 插件配置集合
#[derive(Debug, Clone, Default)]
pub struct PluginConfigManager {
    configs: HashMap<String, PluginConfig>,
    config_path: Option<PathBuf>,
}

impl PluginConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从文件加载；文件不存在时返回空集合
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let configs = Self::read_configs(&path)?;
        Ok(Self {
            configs,
            config_path: Some(path),
        })
    }

    fn read_configs(path: &Path) -> PluginResult<HashMap<String, PluginConfig>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content =
            fs::read_to_string(path).map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        let configs: Vec<PluginConfig> = serde_json::from_str(&content).map_err(|e| {
            PluginError::FileSystemError(format!("{}: {}", path.display(), e))
        })?;
        Ok(configs.into_iter().map(|c| (c.name.clone(), c)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&PluginConfig> {
        self.configs.get(name)
    }

    pub fn set(&mut self, config: PluginConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    pub fn parameter(&self, plugin: &str, key: &str) -> Option<String> {
        self.configs
            .get(plugin)
            .and_then(|c| c.parameters.get(key))
            .cloned()
    }

    /// 没有配置的插件视为启用
    pub fn is_enabled(&self, name: &str) -> bool {
        self.configs.get(name).map_or(true, |c| c.enabled)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.configs.get_mut(name) {
            Some(config) => {
                config.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// 过滤掉禁用的插件并按优先级排序，同优先级保持原顺序
    pub fn load_order(&self, names: &[String]) -> Vec<String> {
        let mut ordered: Vec<(u32, usize, &String)> = names
            .iter()
            .enumerate()
            .filter(|(_, name)| self.is_enabled(name))
            .map(|(i, name)| {
                let priority = self
                    .configs
                    .get(name.as_str())
                    .map_or(PluginConfig::default().priority, |c| c.priority);
                (priority, i, name)
            })
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, _, name)| name.clone()).collect()
    }

    pub fn save(&self) -> PluginResult<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        self.save_to(path)
    }

    pub fn save_to(&self, path: &Path) -> PluginResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        }
        let mut configs: Vec<&PluginConfig> = self.configs.values().collect();
        configs.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        let content = serde_json::to_string_pretty(&configs)
            .map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        fs::write(path, content).map_err(|e| PluginError::FileSystemError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_order_skips_disabled() {
        let mut configs = PluginConfigManager::new();
        configs.set(PluginConfig::named("late").with_priority(200));
        configs.set(PluginConfig::named("early").with_priority(10));
        let mut off = PluginConfig::named("off");
        off.enabled = false;
        configs.set(off);

        let names: Vec<String> = ["late", "off", "plain", "early"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(configs.load_order(&names), vec!["early", "plain", "late"]);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let mut configs = PluginConfigManager::open(&path).unwrap();
        configs.set(PluginConfig::named("sensor").with_parameter("depth", "3"));
        configs.save().unwrap();

        let reopened = PluginConfigManager::open(&path).unwrap();
        assert_eq!(reopened.parameter("sensor", "depth").as_deref(), Some("3"));
        assert!(reopened.is_enabled("unknown"));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, r#"[{"name": "sensor"}]"#).unwrap();
        let configs = PluginConfigManager::open(&path).unwrap();
        let sensor = configs.get("sensor").unwrap();
        assert!(sensor.enabled);
        assert_eq!(sensor.priority, 100);
    }
}
