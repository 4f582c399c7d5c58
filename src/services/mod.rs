//! 框架服务层模块
//!
//! 建立在核心基础层之上的应用服务：设置存储与ECS系统调度

pub mod ecs_scheduler;
pub mod settings;

// 重新导出核心服务
pub use ecs_scheduler::*;
pub use settings::*;
