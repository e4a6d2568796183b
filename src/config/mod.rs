//! 统一配置系统
//!
//! 提供TOML/JSON配置文件和环境变量覆盖

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::impl_default;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 文件读取错误
    #[error("Config file error: {0}")]
    FileError(#[from] std::io::Error),
    /// 解析错误
    #[error("Config parse error: {0}")]
    ParseError(String),
    /// 验证错误
    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// 桥接层主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 脚本运行时配置
    #[serde(default)]
    pub scripting: ScriptingConfig,

    /// 插件配置
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// 持久化存储配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl BridgeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从TOML文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_json_str(&content)
    }

    /// 从JSON字符串解析配置
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 保存为TOML文件
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 保存为JSON文件
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 从环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BRIDGE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                self.logging.level = level;
            }
        }
        if let Ok(val) = env::var("BRIDGE_INTERRUPT_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.scripting.interrupt_interval = interval;
            }
        }
        if let Ok(val) = env::var("BRIDGE_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("BRIDGE_VERBOSE_ERRORS") {
            self.scripting.verbose_errors = val.parse().unwrap_or(self.scripting.verbose_errors);
        }
    }

    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scripting.interrupt_interval == 0 {
            return Err(ConfigError::ValidationError(
                "scripting.interrupt_interval must be greater than zero".to_string(),
            ));
        }
        if self.scripting.prompt.is_empty() {
            return Err(ConfigError::ValidationError(
                "scripting.prompt must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// 自动查找并加载配置文件
    ///
    /// 按以下顺序查找：
    /// 1. ./struct_bridge.toml
    /// 2. ./struct_bridge.json
    /// 3. 用户配置目录下的 struct_bridge/config.toml
    /// 4. 使用默认配置
    pub fn load_or_default() -> Self {
        if let Ok(config) = Self::from_toml_file("struct_bridge.toml") {
            tracing::info!(target: "bridge", "Loaded config from struct_bridge.toml");
            return config;
        }

        if let Ok(config) = Self::from_json_file("struct_bridge.json") {
            tracing::info!(target: "bridge", "Loaded config from struct_bridge.json");
            return config;
        }

        if let Some(dir) = dirs::config_dir() {
            let config_path = dir.join("struct_bridge").join("config.toml");
            if let Ok(config) = Self::from_toml_file(&config_path) {
                tracing::info!(target: "bridge", "Loaded config from {:?}", config_path);
                return config;
            }
        }

        tracing::info!(target: "bridge", "Using default configuration");
        Self::default()
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,

    /// 是否输出ANSI颜色
    pub ansi: bool,
}

impl_default!(LoggingConfig {
    level: LogLevel::Info,
    ansi: true,
});

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// 跟踪
    Trace,
    /// 调试
    Debug,
    /// 信息
    Info,
    /// 警告
    Warn,
    /// 错误
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// EnvFilter 指令字符串
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// 脚本运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// 中断检查间隔（指令数）
    pub interrupt_interval: u32,

    /// 控制台是否打印完整错误链
    pub verbose_errors: bool,

    /// 交互提示符
    pub prompt: String,

    /// 保存结果变量 `_1.._N` 的最大个数
    pub history_vars: usize,
}

impl_default!(ScriptingConfig {
    interrupt_interval: 256,
    verbose_errors: false,
    prompt: "lua> ".to_string(),
    history_vars: 16,
});

/// 插件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// 动态库插件目录
    pub directory: PathBuf,

    /// 是否监视目录并热重载
    pub hot_reload: bool,

    /// 启动时自动加载的插件
    #[serde(default)]
    pub autoload: Vec<String>,
}

impl_default!(PluginsConfig {
    directory: PathBuf::from("plugins"),
    hot_reload: false,
    autoload: Vec::new(),
});

/// 持久化存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON 存储文件，未设置时只保存在内存中
    pub path: Option<PathBuf>,
}
