//! 日志初始化

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 初始化日志系统
///
/// 配置tracing日志框架。设置了`RUST_LOG`环境变量时以它为准，
/// 否则使用配置中的级别。重复调用是安全的。
pub fn initialize_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .try_init();
    tracing::info!(target: "bridge", "Logging initialized");
}
