//! 异步事件队列
//!
//! 每个操作系统线程一个实例（线程局部单例，首次使用时惰性创建），接收来自其他
//! 线程的槽调用，合并重复调用，并在所属线程泵送时统一派发。跨线程的修改只通过
//! 这里加锁的入队/出队路径发生。

use crate::core::async_task::WakeSignal;
use crate::core::event::{EventId, SlotId};
use crate::core::lifetime::{Lifetime, LifetimeFlag};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

thread_local! {
    static CURRENT_QUEUE: RefCell<Option<Arc<AsyncEventQueue>>> = const { RefCell::new(None) };
}

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

/// 事务ID：同一次触发产生的所有入队条目共享一个事务ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// 分配新的事务ID
    pub fn next() -> Self {
        Self(NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 队列条目
pub(crate) struct QueuedCall {
    pub(crate) event: EventId,
    pub(crate) event_alive: LifetimeFlag,
    pub(crate) slot: SlotId,
    pub(crate) slot_alive: LifetimeFlag,
    pub(crate) callback: Box<dyn FnOnce() + Send>,
    pub(crate) transaction: TransactionId,
}

impl QueuedCall {
    fn is_live(&self) -> bool {
        self.event_alive.is_alive() && self.slot_alive.is_alive()
    }
}

/// 线程局部异步事件队列
pub struct AsyncEventQueue {
    owner: ThreadId,
    pending: Mutex<Vec<QueuedCall>>,
    wake: Mutex<Option<Arc<WakeSignal>>>,
    lifetime: Lifetime,
}

impl AsyncEventQueue {
    fn new_for_current_thread() -> Self {
        let owner = thread::current().id();
        debug!(?owner, "Async event queue created");
        Self {
            owner,
            pending: Mutex::new(Vec::new()),
            wake: Mutex::new(None),
            lifetime: Lifetime::new_alive(),
        }
    }

    /// 当前线程的事件队列，首次调用时创建
    pub fn current() -> Arc<Self> {
        CURRENT_QUEUE.with(|cell| {
            let mut slot = cell.borrow_mut();
            match slot.as_ref() {
                Some(queue) => Arc::clone(queue),
                None => {
                    let queue = Arc::new(Self::new_for_current_thread());
                    *slot = Some(Arc::clone(&queue));
                    queue
                }
            }
        })
    }

    /// 当前线程是否已经创建过事件队列
    pub fn exists_for_current_thread() -> bool {
        CURRENT_QUEUE.with(|cell| cell.borrow().is_some())
    }

    /// 所属线程
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// 调用者是否位于所属线程
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// 队列自身的生命周期标志
    pub fn lifetime_flag(&self) -> LifetimeFlag {
        self.lifetime.flag()
    }

    /// 设置入队时用于唤醒所属任务的信号
    pub fn set_wake_signal(&self, signal: Option<Arc<WakeSignal>>) {
        *self.wake.lock() = signal;
    }

    /// 入队一个延迟调用
    ///
    /// `coalesce` 为真时，若已存在同一 (事件, 槽) 的待处理条目，则原地替换其回调
    /// （最新者胜出），否则追加到队尾保持 FIFO。
    pub(crate) fn enqueue(&self, call: QueuedCall, coalesce: bool) {
        {
            let mut pending = self.pending.lock();
            let existing = if coalesce {
                pending
                    .iter_mut()
                    .find(|entry| entry.event == call.event && entry.slot == call.slot)
            } else {
                None
            };

            match existing {
                Some(entry) => {
                    trace!(
                        event = call.event.value(),
                        slot = call.slot.value(),
                        transaction = call.transaction.value(),
                        "Coalesced pending slot call"
                    );
                    entry.callback = call.callback;
                    entry.transaction = call.transaction;
                }
                None => pending.push(call),
            }
        }

        let wake = self.wake.lock().clone();
        if let Some(signal) = wake {
            signal.notify();
        }
    }

    /// 派发所有待处理调用，返回是否做了任何工作
    ///
    /// 先在锁内交换出待处理列表，释放锁后再逐个调用；事件或槽已死亡的条目被静默丢弃。
    /// 回调中新入队的条目留到下一次泵送。
    pub fn pump_events(&self) -> bool {
        assert!(
            self.is_current_thread(),
            "async event queue pumped from a thread that does not own it"
        );

        let batch = mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return false;
        }

        let mut did_work = false;
        for call in batch {
            if !call.is_live() {
                trace!(
                    event = call.event.value(),
                    slot = call.slot.value(),
                    "Dropping queued call for destroyed event or slot"
                );
                continue;
            }
            trace!(
                event = call.event.value(),
                slot = call.slot.value(),
                transaction = call.transaction.value(),
                "Dispatching queued slot call"
            );
            (call.callback)();
            did_work = true;
        }
        did_work
    }

    /// 待处理条目数
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// 是否存在指定事件的待处理条目
    pub fn has_pending_for(&self, event: EventId) -> bool {
        self.pending.lock().iter().any(|entry| entry.event == event)
    }

    /// 丢弃所有待处理条目
    pub fn clear(&self) {
        let dropped = mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Cleared async event queue");
        }
    }
}

impl fmt::Debug for AsyncEventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEventQueue")
            .field("owner", &self.owner)
            .field("pending", &self.pending())
            .finish()
    }
}
