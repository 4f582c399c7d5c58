//! 日志初始化

use crate::config::{LogLevel, LoggingConfig};
use tracing::Level;

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// 安装全局 fmt 订阅者；已安装时返回 false，可重复调用
pub fn init_logging(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(Level::from(config.level))
        .with_thread_ids(config.with_thread_ids)
        .with_target(config.with_target)
        .try_init()
        .is_ok()
}
