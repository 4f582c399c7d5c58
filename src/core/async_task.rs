//! 异步任务
//!
//! [`AsyncTask`] 把一个逻辑上的调度工作单元绑定到一个操作系统线程上，拥有消息队列
//! （首次使用时创建）、定时器服务、I/O 服务，以及需要由它泵送的事件队列集合。
//! 运行循环反复泵送消息、事件队列、定时器与 I/O；一轮没有任何工作时触发
//! `idle_work` 事件并在 [`WakeSignal`] 上休眠，直到有投递、入队或定时器到期。
//!
//! 状态机：`Init -> Running -> Halted | Finished`

use crate::config::AsyncTaskConfig;
use crate::core::async_event_queue::AsyncEventQueue;
use crate::core::event::Event;
use crate::core::io_service::IoService;
use crate::core::lifetime::{Lifetime, LifetimeFlag};
use crate::core::message_queue::MessageQueue;
use crate::core::timer_service::TimerService;
use crate::{FoundryError, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// 唤醒信号：投递消息、事件入队时唤醒休眠中的运行循环
///
/// 通知在休眠前到达也不会丢失。
#[derive(Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.condvar.notify_one();
    }

    /// 等待通知或超时，返回是否被通知
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.condvar.wait_for(&mut pending, timeout);
        }
        let notified = *pending;
        *pending = false;
        notified
    }
}

impl fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeSignal")
            .field("pending", &*self.pending.lock())
            .finish()
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Running,
    Halted,
    Finished,
}

/// 异步任务
pub struct AsyncTask {
    name: String,
    config: AsyncTaskConfig,
    state: Mutex<TaskState>,
    // 是否有运行循环在执行；只在持有 `state` 锁时读写
    in_loop: AtomicBool,
    finished: Condvar,
    joined: Mutex<Option<ThreadId>>,
    message_queue: OnceCell<Arc<MessageQueue>>,
    timer_service: Arc<TimerService>,
    io_service: IoService,
    event_queues: Mutex<Vec<Arc<AsyncEventQueue>>>,
    idle_work: Event<()>,
    wake: Arc<WakeSignal>,
    lifetime: Lifetime,
}

impl AsyncTask {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_config(name, AsyncTaskConfig::default())
    }

    pub fn with_config(name: &str, config: AsyncTaskConfig) -> Arc<Self> {
        debug!(task = name, "Async task created");
        Arc::new(Self {
            name: name.to_string(),
            config,
            state: Mutex::new(TaskState::Init),
            in_loop: AtomicBool::new(false),
            finished: Condvar::new(),
            joined: Mutex::new(None),
            message_queue: OnceCell::new(),
            timer_service: TimerService::new(),
            io_service: IoService::new(),
            event_queues: Mutex::new(Vec::new()),
            idle_work: Event::new(),
            wake: Arc::new(WakeSignal::new()),
            lifetime: Lifetime::new_alive(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn lifetime_flag(&self) -> LifetimeFlag {
        self.lifetime.flag()
    }

    /// 绑定到当前线程，并注册当前线程的事件队列
    pub fn join(&self) -> Result<()> {
        let current = thread::current().id();
        {
            let mut joined = self.joined.lock();
            match *joined {
                Some(owner) if owner == current => return Ok(()),
                Some(_) => return Err(FoundryError::TaskAlreadyJoined),
                None => *joined = Some(current),
            }
        }
        self.register_event_queue(AsyncEventQueue::current());
        debug!(task = %self.name, thread = ?current, "Async task joined thread");
        Ok(())
    }

    /// 解除与线程的绑定，注销该线程的事件队列
    pub fn detach(&self) {
        let previous = self.joined.lock().take();
        if let Some(owner) = previous {
            let removed: Vec<Arc<AsyncEventQueue>> = {
                let mut queues = self.event_queues.lock();
                let (removed, kept): (Vec<_>, Vec<_>) = queues
                    .drain(..)
                    .partition(|queue| queue.owner() == owner);
                *queues = kept;
                removed
            };
            for queue in removed {
                queue.set_wake_signal(None);
            }
            debug!(task = %self.name, thread = ?owner, "Async task detached");
        }
    }

    pub fn joined_thread(&self) -> Option<ThreadId> {
        *self.joined.lock()
    }

    /// 消息队列，首次访问时创建
    pub fn message_queue(&self) -> &Arc<MessageQueue> {
        self.message_queue.get_or_init(|| {
            let queue = Arc::new(MessageQueue::new());
            queue.set_wake_signal(Some(Arc::clone(&self.wake)));
            queue
        })
    }

    /// 向任务线程投递一个闭包
    pub fn post<F>(&self, message: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.message_queue().post(message);
    }

    pub fn timer_service(&self) -> &Arc<TimerService> {
        &self.timer_service
    }

    pub fn io_service(&self) -> &IoService {
        &self.io_service
    }

    /// 登记需要由本任务泵送的事件队列
    pub fn register_event_queue(&self, queue: Arc<AsyncEventQueue>) {
        let mut queues = self.event_queues.lock();
        if queues.iter().any(|existing| Arc::ptr_eq(existing, &queue)) {
            return;
        }
        queue.set_wake_signal(Some(Arc::clone(&self.wake)));
        queues.push(queue);
    }

    /// 空闲通知：一轮运行循环没有做任何工作时触发
    pub fn idle_work(&self) -> &Event<()> {
        &self.idle_work
    }

    /// 唤醒休眠中的运行循环
    pub fn wake(&self) {
        self.wake.notify();
    }

    pub fn pump_messages(&self) -> bool {
        match self.message_queue.get() {
            Some(queue) => queue.pump_messages(self.config.max_messages_per_pump),
            None => false,
        }
    }

    /// 泵送属于当前线程的事件队列
    pub fn pump_event_queues(&self) -> bool {
        let queues: Vec<Arc<AsyncEventQueue>> = self
            .event_queues
            .lock()
            .iter()
            .filter(|queue| queue.is_current_thread())
            .cloned()
            .collect();
        let mut did_work = false;
        for queue in queues {
            if queue.pump_events() {
                did_work = true;
            }
        }
        did_work
    }

    /// 执行一轮工作，返回是否做了任何工作
    pub fn do_work(&self) -> Result<bool> {
        if let Some(owner) = self.joined_thread() {
            if owner != thread::current().id() {
                return Err(FoundryError::WrongThread);
            }
        }
        let mut did_work = self.pump_messages();
        if self.pump_event_queues() {
            did_work = true;
        }
        if self.timer_service.poll() {
            did_work = true;
        }
        if self.io_service.poll() {
            did_work = true;
        }
        Ok(did_work)
    }

    /// 在当前线程运行，直到被停止
    pub fn run(&self) -> Result<()> {
        self.join()?;
        if !self.enter_running() {
            return Ok(());
        }
        info!(task = %self.name, "Async task running");

        let result = self.run_until(None);
        self.finish();
        result
    }

    /// 在当前线程运行指定时长或直到被停止；不会使任务进入 `Finished`
    pub fn run_for(&self, duration: Duration) -> Result<()> {
        self.join()?;
        if !self.enter_running() {
            return Ok(());
        }
        let result = self.run_until(Some(Instant::now() + duration));
        self.leave_loop();
        result
    }

    fn enter_running(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Init | TaskState::Running => {
                *state = TaskState::Running;
                self.in_loop.store(true, Ordering::Release);
                true
            }
            TaskState::Halted | TaskState::Finished => false,
        }
    }

    /// `run_for` 退出循环；期间被停止的任务在此结束
    fn leave_loop(&self) {
        let halted = {
            let mut state = self.state.lock();
            self.in_loop.store(false, Ordering::Release);
            *state == TaskState::Halted
        };
        if halted {
            self.finish();
        }
    }

    fn run_until(&self, deadline: Option<Instant>) -> Result<()> {
        while self.state() == TaskState::Running {
            let did_work = self.do_work()?;
            if did_work {
                continue;
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                break;
            }

            self.idle_work.trigger(());
            if self.state() != TaskState::Running {
                break;
            }

            let mut timeout = self.config.idle_timeout();
            if let Some(expiry) = self.timer_service.next_expiry() {
                timeout = timeout.min(expiry.saturating_duration_since(now));
            }
            if let Some(deadline) = deadline {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
            if !timeout.is_zero() {
                trace!(task = %self.name, ?timeout, "Async task idle");
                self.wake.wait_timeout(timeout);
            }
        }
        Ok(())
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        *state = TaskState::Finished;
        self.in_loop.store(false, Ordering::Release);
        self.finished.notify_all();
        info!(task = %self.name, "Async task finished");
    }

    /// 请求停止运行循环；没有循环在执行的任务直接结束
    pub fn halt(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Running if self.in_loop.load(Ordering::Acquire) => {
                    *state = TaskState::Halted
                }
                TaskState::Init | TaskState::Running => {
                    *state = TaskState::Finished;
                    self.finished.notify_all();
                }
                TaskState::Halted | TaskState::Finished => return,
            }
        }
        debug!(task = %self.name, "Async task halted");
        self.wake.notify();
    }

    /// 已停止或已结束
    pub fn halted(&self) -> bool {
        matches!(self.state(), TaskState::Halted | TaskState::Finished)
    }

    /// 强制停止：停止运行循环，丢弃未处理的消息，取消所有定时器
    pub fn cancel(&self) {
        if self.lifetime.flag().is_going() {
            return;
        }
        let _ = self.lifetime.set_destroying();
        self.halt();
        if let Some(queue) = self.message_queue.get() {
            let dropped = queue.clear();
            if dropped > 0 {
                debug!(task = %self.name, dropped, "Discarded pending messages");
            }
        }
        self.timer_service.shutdown();
    }

    pub fn finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// 阻塞直到任务结束
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while *state != TaskState::Finished {
            self.finished.wait(&mut state);
        }
    }

    /// 阻塞直到任务结束或超时，返回是否已结束
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != TaskState::Finished {
            if self.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state == TaskState::Finished
    }
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        self.cancel();
        self.detach();
        let _ = self.lifetime.set_destroyed();
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("joined", &self.joined_thread())
            .finish()
    }
}

/// 在独立操作系统线程上运行一个异步任务
pub struct AsyncThread {
    task: Arc<AsyncTask>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncThread {
    /// 启动线程；`setup` 在任务线程上、运行循环开始前执行，可在其中订阅事件、创建定时器
    pub fn spawn<F>(name: &str, setup: F) -> Result<Self>
    where
        F: FnOnce(&Arc<AsyncTask>) + Send + 'static,
    {
        Self::spawn_with_config(name, AsyncTaskConfig::default(), setup)
    }

    pub fn spawn_with_config<F>(name: &str, config: AsyncTaskConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(&Arc<AsyncTask>) + Send + 'static,
    {
        let task = AsyncTask::with_config(name, config);
        let thread_task = Arc::clone(&task);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = thread_task.join() {
                    error!(task = %thread_task.name(), "Failed to join async task: {}", e);
                    return;
                }
                setup(&thread_task);
                if let Err(e) = thread_task.run() {
                    error!(task = %thread_task.name(), "Async task run loop failed: {}", e);
                }
                thread_task.detach();
            })?;
        Ok(Self {
            task,
            handle: Some(handle),
        })
    }

    pub fn task(&self) -> &Arc<AsyncTask> {
        &self.task
    }

    /// 停止任务并等待线程退出
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.task.halt();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.task.name(), "Async thread panicked");
            }
        }
    }
}

impl Drop for AsyncThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncThread")
            .field("task", &self.task)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timer::{CallbackTimer, TimerHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wake_signal_is_not_lost() {
        let signal = WakeSignal::new();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_posted_messages_run_on_do_work() {
        let task = AsyncTask::new("test");
        task.join().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        task.post(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.do_work().unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!task.do_work().unwrap());
    }

    #[test]
    fn test_join_twice_from_other_thread_fails() {
        let task = AsyncTask::new("test");
        task.join().unwrap();
        task.join().unwrap();

        let other = Arc::clone(&task);
        let result = thread::spawn(move || other.join()).join().unwrap();
        assert!(matches!(result, Err(FoundryError::TaskAlreadyJoined)));

        let other = Arc::clone(&task);
        let result = thread::spawn(move || other.do_work()).join().unwrap();
        assert!(matches!(result, Err(FoundryError::WrongThread)));

        task.detach();
        assert!(task.joined_thread().is_none());
    }

    #[test]
    fn test_halt_from_message_finishes_run() {
        let task = AsyncTask::new("test");
        let handle = Arc::clone(&task);
        task.post(move || handle.halt());

        task.run().unwrap();
        assert!(task.finished());
        assert!(task.halted());
        task.wait();
    }

    #[test]
    fn test_halt_before_run_finishes_immediately() {
        let task = AsyncTask::new("test");
        task.halt();
        assert!(task.finished());
        task.run().unwrap();
        assert!(task.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_halt_after_run_for_finishes() {
        let task = AsyncTask::new("test");
        task.run_for(Duration::from_millis(5)).unwrap();
        assert_eq!(task.state(), TaskState::Running);

        task.halt();
        assert!(task.wait_for(Duration::from_millis(300)));
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[test]
    fn test_halt_during_run_for_finishes_on_exit() {
        let task = AsyncTask::new("test");
        let halt = Arc::clone(&task);
        task.post(move || halt.halt());
        task.run_for(Duration::from_secs(5)).unwrap();
        assert!(task.finished());
    }

    #[test]
    fn test_run_for_drives_timers() {
        let task = AsyncTask::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let _timer = CallbackTimer::new(
            task.timer_service(),
            move |_: &TimerHandle| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            true,
        );

        task.run_for(Duration::from_millis(100)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_idle_work_fires_when_nothing_to_do() {
        let task = AsyncTask::new("test");
        let idle = Arc::new(AtomicUsize::new(0));
        let idle_clone = Arc::clone(&idle);
        let halt = Arc::clone(&task);
        let _sub = task.idle_work().subscribe(move |_| {
            idle_clone.fetch_add(1, Ordering::SeqCst);
            halt.halt();
        });

        task.run().unwrap();
        assert_eq!(idle.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_discards_messages_and_timers() {
        let task = AsyncTask::new("test");
        task.join().unwrap();
        task.post(|| panic!("cancelled task must not run messages"));
        task.cancel();

        assert!(task.finished());
        assert!(!task.do_work().unwrap());
        assert!(task.lifetime_flag().is_going());
    }

    #[test]
    fn test_async_thread_runs_posted_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = AsyncThread::spawn("worker", |_| {}).unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);
        let counter_clone = Arc::clone(&counter);
        worker.task().post(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(thread::current().id());
        });

        let worker_id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker_id, thread::current().id());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let task = Arc::clone(worker.task());
        worker.stop();
        assert!(task.finished());
    }
}
