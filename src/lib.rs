//! Foundry - 应用基础框架
//!
//! 为长时间运行的应用提供线程亲和的事件总线、定时器、异步任务与工作窃取线程池。
//!
//! # 架构分层
//!
//! - **核心基础层**: 生命周期令牌、事件/槽、异步事件队列、定时器、异步任务、线程池
//! - **可插拔接口层**: 服务定位器与插件管理
//! - **框架服务层**: 设置存储、ECS系统调度
//!
//! # 线程模型
//!
//! 每个槽都有所属线程。在所属线程上触发时槽被同步调用，否则调用被投递到所属线程的
//! 异步事件队列，由该线程上运行的 [`AsyncTask`] 泵出。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod services;

// 重新导出核心类型
pub use crate::core::*;
pub use error::*;
pub use plugins::*;
pub use services::*;

/// 框架信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const FRAMEWORK_NAME: &str = "Foundry";

/// 快速启动：按配置初始化日志
pub fn initialize(config: &config::LoggingConfig) {
    logging::init_logging(config);
    tracing::info!("🚀 Initializing {} v{}", FRAMEWORK_NAME, VERSION);
}
