//! 可插拔接口层模块
//!
//! 服务定位器与进程内插件管理

pub mod core;
pub mod manager;
pub mod service_provider;

// 重新导出核心组件
pub use self::core::*;
pub use manager::*;
pub use service_provider::*;
