//! Foundry 错误处理系统
//!
//! 统一的错误类型和错误处理机制。使用错误（重复启动定时器、非法生命周期
//! 转换、服务缺失等）在调用点以具名错误返回；正常的并发竞争（队列条目的
//! 事件已销毁等）在内部吸收，不会出现在这里。

use crate::core::lifetime::LifetimeState;
use thiserror::Error;

/// 框架统一错误类型
#[derive(Error, Debug)]
pub enum FoundryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid lifetime transition: {from:?} -> {to:?}")]
    InvalidLifetimeTransition { from: LifetimeState, to: LifetimeState },

    #[error("Timer is already waiting")]
    AlreadyWaiting,

    #[error("Timer is already enabled")]
    AlreadyEnabled,

    #[error("Timer is already disabled")]
    AlreadyDisabled,

    #[error("Operation must be performed on the owning thread")]
    WrongThread,

    #[error("Task is not running")]
    TaskNotRunning,

    #[error("Task is already joined to a thread")]
    TaskAlreadyJoined,

    #[error("Thread pool has been stopped")]
    PoolStopped,

    #[error("Task was abandoned before producing a result")]
    TaskAbandoned,

    #[error("Service not found: {key}")]
    ServiceNotFound { key: String },

    #[error("Service already registered: {key}")]
    ServiceAlreadyRegistered { key: String },

    #[error("Plugin not found: {plugin_id}")]
    PluginNotFound { plugin_id: String },

    #[error("Plugin already registered: {plugin_id}")]
    PluginAlreadyRegistered { plugin_id: String },

    #[error("Plugin load error: {message}")]
    PluginLoad { message: String },

    #[error("Setting not found: {key}")]
    SettingNotFound { key: String },

    #[error("Setting already registered: {key}")]
    SettingAlreadyRegistered { key: String },

    #[error("Setting type mismatch for {key}: expected {expected}")]
    SettingTypeMismatch { key: String, expected: String },

    #[error("System not found: {name}")]
    SystemNotFound { name: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FoundryError {
    /// 创建配置相关错误
    pub fn config(message: &str) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    /// 创建插件加载错误
    pub fn plugin_load(message: &str) -> Self {
        Self::PluginLoad {
            message: message.to_string(),
        }
    }

    /// 创建内部错误
    pub fn internal(message: &str) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, FoundryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = FoundryError::config("Test config error");
        assert!(matches!(error, FoundryError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test config error");
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = FoundryError::from(io_error);
        assert!(matches!(error, FoundryError::Io(_)));
    }

    #[test]
    fn test_lifetime_transition_message() {
        let error = FoundryError::InvalidLifetimeTransition {
            from: LifetimeState::Destroying,
            to: LifetimeState::Alive,
        };
        assert_eq!(error.to_string(), "Invalid lifetime transition: Destroying -> Alive");
    }

    #[test]
    fn test_result_type() {
        let success: Result<i32> = Ok(42);
        let failure: Result<i32> = Err(FoundryError::AlreadyWaiting);

        assert!(success.is_ok());
        assert!(failure.is_err());
    }
}
