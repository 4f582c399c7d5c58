//! ECS 系统调度器
//!
//! 中央定时器挂在一个异步任务上，每个周期通过 `Event<SystemTick>` 发布一次 tick。
//! 普通系统在触发线程上同步执行；线程化系统拥有独立的 [`AsyncThread`]，以无状态槽
//! 订阅 tick，消费慢于生产时只处理最新的一次。暂停/恢复映射到中央定时器的
//! disable/enable。

use crate::config::EcsConfig;
use crate::core::async_event_queue::AsyncEventQueue;
use crate::core::async_task::{AsyncTask, AsyncThread};
use crate::core::event::{Event, EventRef, SlotOptions, Subscription, TriggerResult};
use crate::core::timer::{CallbackTimer, TimerHandle};
use crate::{FoundryError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 一次调度 tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemTick {
    /// 帧序号，从 1 开始
    pub frame: u64,
    /// 距上一帧的时间
    pub delta: Duration,
    /// 距第一帧的时间
    pub elapsed: Duration,
}

/// ECS 系统
pub trait System: Send + 'static {
    fn name(&self) -> &str;
    fn update(&mut self, tick: &SystemTick);
}

#[derive(Default)]
struct Clock {
    frame: u64,
    started_at: Option<Instant>,
    last_tick: Option<Instant>,
}

impl Clock {
    fn advance(&mut self) -> SystemTick {
        let now = Instant::now();
        let started_at = *self.started_at.get_or_insert(now);
        let delta = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_tick = Some(now);
        self.frame += 1;
        SystemTick {
            frame: self.frame,
            delta,
            elapsed: now.saturating_duration_since(started_at),
        }
    }
}

fn publish(clock: &Mutex<Clock>, ticks: &EventRef<SystemTick>) -> TriggerResult {
    let tick = clock.lock().advance();
    ticks.trigger(tick)
}

struct SystemEntry {
    name: String,
    paused: Arc<AtomicBool>,
    // 字段按声明顺序析构：先退订，再停止线程
    _subscription: Subscription<SystemTick>,
    thread: Option<AsyncThread>,
}

/// ECS 调度器
pub struct EcsScheduler {
    task: Arc<AsyncTask>,
    interval: Duration,
    ticks: Event<SystemTick>,
    clock: Arc<Mutex<Clock>>,
    timer: Mutex<Option<CallbackTimer>>,
    systems: Mutex<Vec<SystemEntry>>,
}

impl EcsScheduler {
    /// 以 `task` 为中央任务创建调度器
    pub fn new(task: Arc<AsyncTask>, interval: Duration) -> Self {
        Self {
            task,
            interval,
            ticks: Event::new(),
            clock: Arc::new(Mutex::new(Clock::default())),
            timer: Mutex::new(None),
            systems: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(task: Arc<AsyncTask>, config: &EcsConfig) -> Self {
        Self::new(task, config.tick_interval())
    }

    /// tick 事件
    pub fn ticks(&self) -> &Event<SystemTick> {
        &self.ticks
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 添加在触发线程上同步执行的系统
    pub fn add_system<S: System>(&self, system: S) -> Result<()> {
        let name = system.name().to_string();
        let paused = Arc::new(AtomicBool::new(false));
        let callback = Self::system_callback(system, &paused);
        let subscription = self
            .ticks
            .subscribe_with(SlotOptions::new().in_emitter_thread(), callback);
        self.insert(SystemEntry {
            name,
            paused,
            _subscription: subscription,
            thread: None,
        })
    }

    /// 添加在独立线程上执行的系统；积压的 tick 合并为最新一次
    pub fn add_threaded_system<S: System>(&self, system: S) -> Result<()> {
        let name = system.name().to_string();
        if self.has_system(&name) {
            return Err(FoundryError::internal(&format!("System already added: {}", name)));
        }

        let (sender, receiver) = crossbeam::channel::bounded::<Arc<AsyncEventQueue>>(1);
        let thread = AsyncThread::spawn(&format!("ecs-{}", name), move |_| {
            let _ = sender.send(AsyncEventQueue::current());
        })?;
        let queue = receiver
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| FoundryError::internal(&format!("System thread did not start: {}", name)))?;

        let paused = Arc::new(AtomicBool::new(false));
        let callback = Self::system_callback(system, &paused);
        let subscription = self.ticks.subscribe_with(
            SlotOptions::new().on_queue(&queue).stateless(true),
            callback,
        );
        self.insert(SystemEntry {
            name,
            paused,
            _subscription: subscription,
            thread: Some(thread),
        })
    }

    fn system_callback<S: System>(
        system: S,
        paused: &Arc<AtomicBool>,
    ) -> impl Fn(&SystemTick) + Send + Sync + 'static {
        let system = Mutex::new(system);
        let paused = Arc::clone(paused);
        move |tick: &SystemTick| {
            if !paused.load(Ordering::Acquire) {
                system.lock().update(tick);
            }
        }
    }

    fn insert(&self, entry: SystemEntry) -> Result<()> {
        let mut systems = self.systems.lock();
        if systems.iter().any(|existing| existing.name == entry.name) {
            return Err(FoundryError::internal(&format!(
                "System already added: {}",
                entry.name
            )));
        }
        debug!(system = %entry.name, threaded = entry.thread.is_some(), "System added");
        systems.push(entry);
        Ok(())
    }

    /// 移除系统
    pub fn remove_system(&self, name: &str) -> Result<()> {
        let removed = {
            let mut systems = self.systems.lock();
            let index = systems
                .iter()
                .position(|entry| entry.name == name)
                .ok_or_else(|| FoundryError::SystemNotFound {
                    name: name.to_string(),
                })?;
            systems.remove(index)
        };
        // 线程在锁外停止
        drop(removed);
        Ok(())
    }

    pub fn has_system(&self, name: &str) -> bool {
        self.systems.lock().iter().any(|entry| entry.name == name)
    }

    pub fn system_names(&self) -> Vec<String> {
        self.systems
            .lock()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// 启动中央定时器
    pub fn start(&self) -> Result<()> {
        let mut timer = self.timer.lock();
        match timer.as_ref() {
            Some(existing) if existing.enabled() => return Err(FoundryError::AlreadyEnabled),
            Some(existing) => existing.enable(true)?,
            None => {
                let clock = Arc::clone(&self.clock);
                let ticks = self.ticks.handle();
                *timer = Some(CallbackTimer::with_context(
                    self.task.timer_service(),
                    self.task.lifetime_flag(),
                    move |timer: &TimerHandle| {
                        publish(&clock, &ticks);
                        // tick 期间被暂停时不再续期
                        if let Err(e) = timer.again_if_enabled() {
                            warn!("Failed to re-arm ECS tick timer: {}", e);
                        }
                    },
                    self.interval,
                    true,
                ));
            }
        }
        info!(interval = ?self.interval, task = %self.task.name(), "ECS scheduler started");
        Ok(())
    }

    /// 暂停：禁用中央定时器
    pub fn pause(&self) -> Result<()> {
        let timer = self.timer.lock();
        timer.as_ref().ok_or(FoundryError::TaskNotRunning)?.disable()?;
        debug!("ECS scheduler paused");
        Ok(())
    }

    /// 恢复：启用并重新布防中央定时器
    pub fn resume(&self) -> Result<()> {
        let timer = self.timer.lock();
        timer.as_ref().ok_or(FoundryError::TaskNotRunning)?.enable(true)?;
        debug!("ECS scheduler resumed");
        Ok(())
    }

    /// 未启动或已暂停
    pub fn paused(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map_or(true, |timer| timer.disabled())
    }

    pub fn pause_system(&self, name: &str) -> Result<()> {
        self.set_system_paused(name, true)
    }

    pub fn resume_system(&self, name: &str) -> Result<()> {
        self.set_system_paused(name, false)
    }

    pub fn system_paused(&self, name: &str) -> Result<bool> {
        self.systems
            .lock()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.paused.load(Ordering::Acquire))
            .ok_or_else(|| FoundryError::SystemNotFound {
                name: name.to_string(),
            })
    }

    fn set_system_paused(&self, name: &str, paused: bool) -> Result<()> {
        let systems = self.systems.lock();
        let entry = systems
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| FoundryError::SystemNotFound {
                name: name.to_string(),
            })?;
        entry.paused.store(paused, Ordering::Release);
        Ok(())
    }

    /// 立即在调用线程上发布一次 tick
    pub fn tick_now(&self) -> SystemTick {
        let tick = self.clock.lock().advance();
        self.ticks.trigger(tick);
        tick
    }

    /// 已发布的帧数
    pub fn frame(&self) -> u64 {
        self.clock.lock().frame
    }

    /// 停止定时器并移除所有系统
    pub fn stop(&self) {
        let timer = self.timer.lock().take();
        drop(timer);
        let systems = std::mem::take(&mut *self.systems.lock());
        let count = systems.len();
        drop(systems);
        info!(systems = count, frames = self.frame(), "ECS scheduler stopped");
    }
}

impl Drop for EcsScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for EcsScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcsScheduler")
            .field("interval", &self.interval)
            .field("frame", &self.frame())
            .field("systems", &self.system_names())
            .finish()
    }
}
