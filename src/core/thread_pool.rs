//! 线程池
//!
//! 有上限、可增长的工作线程集合。每个工作线程有自己的优先级队列；取任务时比较
//! 所有队列的队首，优先级最高者胜出，取自其他线程的队列即为窃取。提交时优先交给空闲线程，否则在上限内新建线程，再否则
//! 排入负载最轻的线程队列。

use crate::config::ThreadPoolConfig;
use crate::{FoundryError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    Critical = 0,   // 关键任务，最高优先级
    High = 1,       // 高优先级
    #[default]
    Normal = 2,     // 普通优先级
    Low = 3,        // 低优先级
    Background = 4, // 后台任务
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,    // 等待执行
    Running,    // 正在执行
    Completed,  // 已完成
    Failed,     // 执行时 panic
    Cancelled,  // 已取消
}

/// 池任务
pub trait PoolTask: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> PoolTask for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

struct TaskControl {
    id: u64,
    status: Mutex<TaskStatus>,
}

impl TaskControl {
    /// `Pending -> Running`，已取消时返回 false
    fn begin(&self) -> bool {
        let mut status = self.status.lock();
        if *status == TaskStatus::Pending {
            *status = TaskStatus::Running;
            true
        } else {
            false
        }
    }

    /// `Pending -> Cancelled`
    fn cancel(&self) -> bool {
        let mut status = self.status.lock();
        if *status == TaskStatus::Pending {
            *status = TaskStatus::Cancelled;
            true
        } else {
            false
        }
    }

    fn finish(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }
}

/// 已提交任务的句柄
#[derive(Clone)]
pub struct TaskHandle {
    control: Arc<TaskControl>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn status(&self) -> TaskStatus {
        *self.control.status.lock()
    }

    /// 取消尚未开始的任务，返回是否成功
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status(),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// `run` 返回的结果 future；任务 panic 或被取消时得到 [`FoundryError::TaskAbandoned`]
pub struct TaskFuture<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> TaskFuture<T> {
    /// 阻塞当前线程直到结果可用
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| FoundryError::TaskAbandoned))
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture").finish_non_exhaustive()
    }
}

/// 任务包装器
struct QueuedTask {
    priority: TaskPriority,
    sequence: u64,
    task: Box<dyn PoolTask>,
    control: Arc<TaskControl>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // 优先级高的先执行，同优先级先提交的先执行
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// 线程池统计信息
#[derive(Debug, Clone, Default)]
pub struct ThreadPoolMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_stolen: u64,
    pub peak_threads: usize,
}

struct Worker {
    queue: BinaryHeap<QueuedTask>,
    busy: bool,
}

struct PoolState {
    workers: Vec<Worker>,
    handles: Vec<JoinHandle<()>>,
    max_threads: usize,
    stopped: bool,
    next_sequence: u64,
    // 由 `steal_work` 在调用线程上执行中的任务数
    in_flight: usize,
    metrics: ThreadPoolMetrics,
}

impl PoolState {
    fn busy(&self) -> bool {
        self.in_flight > 0
            || self
                .workers
                .iter()
                .any(|worker| worker.busy || !worker.queue.is_empty())
    }

    /// 取出全池优先级最高的可执行任务；来自其他线程队列时记为窃取
    fn take_task(&mut self, own: Option<usize>) -> Option<QueuedTask> {
        loop {
            let index = self.best_queue()?;
            let task = self.workers[index].queue.pop()?;
            if Some(index) != own {
                self.metrics.tasks_stolen += 1;
                trace!(task = task.control.id, victim = index, thief = ?own, "Stole pool task");
            }
            if task.control.begin() {
                return Some(task);
            }
            self.metrics.tasks_cancelled += 1;
            trace!(task = task.control.id, "Skipping cancelled pool task");
        }
    }

    /// 队首优先级最高的队列；同优先级时先提交者胜出
    fn best_queue(&self) -> Option<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter_map(|(index, worker)| worker.queue.peek().map(|task| (index, task)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(index, _)| index)
    }

    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.metrics.tasks_completed += 1,
            TaskStatus::Failed => self.metrics.tasks_failed += 1,
            _ => {}
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    idle: Condvar,
    next_task_id: AtomicU64,
}

/// 线程池
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// 以 CPU 核数为上限创建线程池
    pub fn new() -> Self {
        Self::with_max_threads(num_cpus::get())
    }

    pub fn with_max_threads(max_threads: usize) -> Self {
        let max_threads = max_threads.max(1);
        debug!(max_threads, "Thread pool created");
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    handles: Vec::new(),
                    max_threads,
                    stopped: false,
                    next_sequence: 0,
                    in_flight: 0,
                    metrics: ThreadPoolMetrics::default(),
                }),
                work_available: Condvar::new(),
                idle: Condvar::new(),
                next_task_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &ThreadPoolConfig) -> Self {
        Self::with_max_threads(config.effective_max_threads())
    }

    /// 预先创建工作线程，至多到上限
    pub fn reserve(&self, threads: usize) -> Result<usize> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(FoundryError::PoolStopped);
        }
        let target = threads.min(state.max_threads);
        while state.workers.len() < target {
            self.spawn_worker(&mut state)?;
        }
        Ok(state.workers.len())
    }

    /// 提交任务：交给空闲线程、在上限内扩容，或排队
    pub fn start<T>(&self, task: T, priority: TaskPriority) -> Result<TaskHandle>
    where
        T: PoolTask,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(FoundryError::PoolStopped);
        }
        let (queued, handle) = self.wrap(&mut state, Box::new(task), priority);

        if let Some(index) = Self::idle_worker(&state) {
            Self::assign(&mut state, index, queued);
            self.shared.work_available.notify_all();
            return Ok(handle);
        }

        if state.workers.len() < state.max_threads {
            match self.spawn_worker(&mut state) {
                Ok(index) => {
                    Self::assign(&mut state, index, queued);
                    return Ok(handle);
                }
                Err(e) if state.workers.is_empty() => return Err(e),
                Err(e) => warn!("Failed to grow thread pool: {}", e),
            }
        }

        let index = Self::least_loaded(&state);
        state.workers[index].queue.push(queued);
        trace!(task = handle.id(), worker = index, ?priority, "Pool task queued");
        self.shared.work_available.notify_all();
        Ok(handle)
    }

    /// 仅在有空闲容量时提交，否则返回 `None` 而不排队
    pub fn try_start<T>(&self, task: T, priority: TaskPriority) -> Option<TaskHandle>
    where
        T: PoolTask,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return None;
        }
        if let Some(index) = Self::idle_worker(&state) {
            let (queued, handle) = self.wrap(&mut state, Box::new(task), priority);
            Self::assign(&mut state, index, queued);
            self.shared.work_available.notify_all();
            return Some(handle);
        }
        if state.workers.len() < state.max_threads {
            return match self.spawn_worker(&mut state) {
                Ok(index) => {
                    let (queued, handle) = self.wrap(&mut state, Box::new(task), priority);
                    Self::assign(&mut state, index, queued);
                    Some(handle)
                }
                Err(e) => {
                    warn!("Failed to grow thread pool: {}", e);
                    None
                }
            };
        }
        None
    }

    /// 以普通优先级运行一个闭包，返回结果 future 与任务句柄
    pub fn run<F, R>(&self, function: F) -> Result<(TaskFuture<R>, TaskHandle)>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_with_priority(function, TaskPriority::Normal)
    }

    pub fn run_with_priority<F, R>(
        &self,
        function: F,
        priority: TaskPriority,
    ) -> Result<(TaskFuture<R>, TaskHandle)>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let handle = self.start(
            move || {
                let _ = sender.send(function());
            },
            priority,
        )?;
        Ok((TaskFuture { receiver }, handle))
    }

    /// 在调用线程上执行一个从工作线程队列窃取的任务，返回是否执行了任务
    pub fn steal_work(&self) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            let task = state.take_task(None);
            if task.is_some() {
                state.in_flight += 1;
            }
            task
        };
        match task {
            Some(task) => {
                let status = execute(task);
                let mut state = self.shared.state.lock();
                state.in_flight -= 1;
                state.record(status);
                if !state.busy() {
                    self.shared.idle.notify_all();
                }
                true
            }
            None => false,
        }
    }

    /// 阻塞直到没有正在执行或排队的任务
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.busy() {
            self.shared.idle.wait(&mut state);
        }
    }

    /// 终止线程池：不再接受任务，取消排队任务，等待工作线程退出
    pub fn stop(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let mut cancelled = 0u64;
            for worker in &mut state.workers {
                for queued in worker.queue.drain() {
                    queued.control.cancel();
                    cancelled += 1;
                }
            }
            state.metrics.tasks_cancelled += cancelled;
            info!(cancelled, "Thread pool stopping");
            std::mem::take(&mut state.handles)
        };
        self.shared.work_available.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Thread pool worker panicked");
            }
        }
        self.shared.idle.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    pub fn busy(&self) -> bool {
        self.shared.state.lock().busy()
    }

    /// 正在执行任务的线程数
    pub fn active_threads(&self) -> usize {
        self.shared
            .state
            .lock()
            .workers
            .iter()
            .filter(|worker| worker.busy)
            .count()
    }

    pub fn total_threads(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    pub fn idle_threads(&self) -> usize {
        let state = self.shared.state.lock();
        state.workers.iter().filter(|worker| !worker.busy).count()
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared
            .state
            .lock()
            .workers
            .iter()
            .map(|worker| worker.queue.len())
            .sum()
    }

    pub fn metrics(&self) -> ThreadPoolMetrics {
        self.shared.state.lock().metrics.clone()
    }

    fn wrap(
        &self,
        state: &mut PoolState,
        task: Box<dyn PoolTask>,
        priority: TaskPriority,
    ) -> (QueuedTask, TaskHandle) {
        let control = Arc::new(TaskControl {
            id: self.shared.next_task_id.fetch_add(1, AtomicOrdering::Relaxed),
            status: Mutex::new(TaskStatus::Pending),
        });
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.metrics.tasks_submitted += 1;
        let handle = TaskHandle {
            control: Arc::clone(&control),
        };
        (
            QueuedTask {
                priority,
                sequence,
                task,
                control,
            },
            handle,
        )
    }

    fn idle_worker(state: &PoolState) -> Option<usize> {
        state
            .workers
            .iter()
            .position(|worker| !worker.busy && worker.queue.is_empty())
    }

    fn least_loaded(state: &PoolState) -> usize {
        state
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.queue.len())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn assign(state: &mut PoolState, index: usize, queued: QueuedTask) {
        trace!(task = queued.control.id, worker = index, "Pool task assigned");
        // 先标记忙碌，避免同一空闲线程被重复选中
        state.workers[index].busy = true;
        state.workers[index].queue.push(queued);
    }

    /// 新建一个空闲工作线程；调用方持有状态锁，新线程在锁释放后才开始取任务
    fn spawn_worker(&self, state: &mut PoolState) -> Result<usize> {
        let index = state.workers.len();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("foundry-pool-{}", index))
            .spawn(move || worker_loop(shared, index))?;

        state.workers.push(Worker {
            queue: BinaryHeap::new(),
            busy: false,
        });
        state.handles.push(handle);
        state.metrics.peak_threads = state.metrics.peak_threads.max(state.workers.len());
        debug!(worker = index, total = state.workers.len(), "Pool worker spawned");
        Ok(index)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadPool")
            .field("max_threads", &state.max_threads)
            .field("threads", &state.workers.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

fn execute(queued: QueuedTask) -> TaskStatus {
    let QueuedTask { task, control, .. } = queued;
    let status = match panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
        Ok(()) => TaskStatus::Completed,
        Err(_) => {
            error!(task = control.id, "Pool task panicked");
            TaskStatus::Failed
        }
    };
    control.finish(status);
    status
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.take_task(Some(index)) {
            state.workers[index].busy = true;
            let status = MutexGuard::unlocked(&mut state, || execute(task));
            state.record(status);
            continue;
        }
        state.workers[index].busy = false;
        if !state.busy() {
            shared.idle.notify_all();
        }
        if state.stopped {
            break;
        }
        shared.work_available.wait(&mut state);
    }
    trace!(worker = index, "Pool worker exiting");
}
