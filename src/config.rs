//! Foundry 配置管理系统
//!
//! 支持YAML配置文件驱动的框架启动

use crate::{FoundryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 框架配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FoundryConfig {
    /// 框架基础设置
    pub framework: FrameworkSettings,
    /// 线程池配置
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    /// 异步任务配置
    #[serde(default)]
    pub async_task: AsyncTaskConfig,
    /// ECS 调度配置
    #[serde(default)]
    pub ecs: EcsConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 框架基础设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkSettings {
    /// 框架名称
    pub name: String,
    /// 版本
    pub version: String,
}

impl Default for FrameworkSettings {
    fn default() -> Self {
        Self {
            name: crate::FRAMEWORK_NAME.to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// 线程池配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// 最大线程数，0 表示使用 CPU 核数
    #[serde(default)]
    pub max_threads: usize,
}

impl ThreadPoolConfig {
    pub fn effective_max_threads(&self) -> usize {
        if self.max_threads == 0 {
            num_cpus::get()
        } else {
            self.max_threads
        }
    }
}

/// 异步任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTaskConfig {
    /// 空闲时最长休眠时间（毫秒）
    pub idle_timeout_ms: u64,
    /// 每轮最多处理的消息数，0 表示不限
    pub max_messages_per_pump: usize,
}

impl AsyncTaskConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for AsyncTaskConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10,
            max_messages_per_pump: 256,
        }
    }
}

/// ECS 调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcsConfig {
    /// 中央定时器周期（毫秒）
    pub tick_interval_ms: u64,
}

impl EcsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否输出线程ID
    #[serde(default)]
    pub with_thread_ids: bool,
    /// 是否输出 target
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: FoundryConfig,
}

impl ConfigManager {
    /// 从文件加载配置
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FoundryError::config(&format!("Failed to read config file: {}", e)))?;

        let config: FoundryConfig = serde_yaml::from_str(&content)
            .map_err(|e| FoundryError::config(&format!("Failed to parse config file: {}", e)))?;

        Ok(Self { config })
    }

    /// 创建默认配置
    pub fn new_default() -> Self {
        Self {
            config: FoundryConfig::default(),
        }
    }

    pub fn from_config(config: FoundryConfig) -> Self {
        Self { config }
    }

    /// 保存配置到文件
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&self.config)
            .map_err(|e| FoundryError::config(&format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| FoundryError::config(&format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// 获取配置
    pub fn get_config(&self) -> &FoundryConfig {
        &self.config
    }

    /// 获取可变配置
    pub fn get_config_mut(&mut self) -> &mut FoundryConfig {
        &mut self.config
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.config.framework.name.is_empty() {
            return Err(FoundryError::config("Framework name cannot be empty"));
        }

        if self.config.async_task.idle_timeout_ms == 0 {
            return Err(FoundryError::config("Async task idle timeout must be positive"));
        }

        if self.config.ecs.tick_interval_ms == 0 {
            return Err(FoundryError::config("ECS tick interval must be positive"));
        }

        if self.config.thread_pool.max_threads > 1024 {
            return Err(FoundryError::config("Thread pool cannot exceed 1024 threads"));
        }

        tracing::info!("Configuration validation passed");
        Ok(())
    }
}

/// 生成默认配置文件
pub async fn generate_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let config_manager = ConfigManager::new_default();
    config_manager.save_to_file(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;

    #[tokio::test]
    async fn test_config_manager_default() {
        let config_manager = ConfigManager::new_default();
        let config = config_manager.get_config();

        assert_eq!(config.framework.name, "Foundry");
        assert_eq!(config.thread_pool.max_threads, 0);
        assert!(config.thread_pool.effective_max_threads() >= 1);
        assert_eq!(config.async_task.idle_timeout(), Duration::from_millis(10));

        assert!(config_manager.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let temp_path = std::env::temp_dir().join(format!("foundry_config_{}.yaml", uuid::Uuid::new_v4()));

        let mut config_manager = ConfigManager::new_default();
        config_manager.get_config_mut().ecs.tick_interval_ms = 33;
        config_manager.save_to_file(&temp_path).await.unwrap();

        let loaded_config = ConfigManager::load_from_file(&temp_path).await.unwrap();
        assert_eq!(loaded_config.get_config().framework.name, "Foundry");
        assert_eq!(loaded_config.get_config().ecs.tick_interval_ms, 33);

        let _ = fs::remove_file(&temp_path).await;
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let result = ConfigManager::load_from_file("definitely/not/here.yaml").await;
        assert!(matches!(result, Err(FoundryError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut config = FoundryConfig::default();
        config.ecs.tick_interval_ms = 0;
        let result = ConfigManager::from_config(config).validate();
        assert!(matches!(result, Err(FoundryError::Config { .. })));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let yaml_str = "framework:\n  name: Demo\n  version: 0.0.1\n";
        let config: FoundryConfig = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(config.framework.name, "Demo");
        assert_eq!(config.ecs.tick_interval_ms, 16);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.logging.with_target);
    }

    #[test]
    fn test_config_serialization() {
        let config = FoundryConfig::default();
        let yaml_str = serde_yaml::to_string(&config).unwrap();

        assert!(yaml_str.contains("Foundry"));
        assert!(yaml_str.contains("thread_pool"));
        assert!(yaml_str.contains("tick_interval_ms"));

        let deserialized: FoundryConfig = serde_yaml::from_str(&yaml_str).unwrap();
        assert_eq!(deserialized.framework.name, "Foundry");
    }
}
