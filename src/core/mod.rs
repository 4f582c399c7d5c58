//! 核心基础层模块
//!
//! 提供框架的核心基础设施：生命周期令牌、事件总线、线程局部异步事件队列、
//! 定时器、异步任务与线程池

pub mod lifetime;
pub mod event;
pub mod async_event_queue;
pub mod timer_service;
pub mod timer;
pub mod message_queue;
pub mod io_service;
pub mod async_task;
pub mod thread_pool;

// 重新导出核心组件
pub use lifetime::*;
pub use event::*;
pub use async_event_queue::*;
pub use timer_service::*;
pub use timer::*;
pub use message_queue::*;
pub use io_service::*;
pub use async_task::*;
pub use thread_pool::*;
