//! 定时器服务
//!
//! 每个异步任务一个 [`TimerService`]，把许多逻辑定时器复用到一次可轮询的到期检查上。
//! [`TimerObject`] 持有到期时间和一组一次性等待者；到期时由所属任务的运行循环调用
//! [`TimerService::poll`] 触发。

use crate::core::lifetime::{Lifetime, LifetimeFlag};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

static NEXT_TIMER_OBJECT: AtomicU64 = AtomicU64::new(1);
static NEXT_WAIT: AtomicU64 = AtomicU64::new(1);

/// 等待者标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitId(u64);

impl WaitId {
    fn next() -> Self {
        Self(NEXT_WAIT.fetch_add(1, Ordering::Relaxed))
    }
}

struct TimerWait {
    id: WaitId,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    cancelled: AtomicBool,
}

impl TimerWait {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // 回调捕获的值在这里释放，不持有定时器对象的锁
        let callback = self.callback.lock().take();
        drop(callback);
    }
}

#[derive(Default)]
struct TimerObjectState {
    expiry: Option<Instant>,
    waits: Vec<Arc<TimerWait>>,
    // 正在派发的等待者；派发期间仍可被取消
    firing: Vec<Arc<TimerWait>>,
}

/// 定时器对象：一个到期时间 + 一组一次性等待者
pub struct TimerObject {
    id: u64,
    state: Mutex<TimerObjectState>,
}

impl TimerObject {
    fn new() -> Self {
        Self {
            id: NEXT_TIMER_OBJECT.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerObjectState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 设置绝对到期时间
    pub fn expires_at(&self, when: Instant) {
        self.state.lock().expiry = Some(when);
    }

    /// 设置相对到期时间
    pub fn expires_from_now(&self, duration: Duration) {
        self.expires_at(Instant::now() + duration);
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.state.lock().expiry
    }

    /// 注册一次性等待者，到期时被调用一次
    pub fn async_wait<F>(&self, callback: F) -> WaitId
    where
        F: FnOnce() + Send + 'static,
    {
        let wait = Arc::new(TimerWait {
            id: WaitId::next(),
            callback: Mutex::new(Some(Box::new(callback))),
            cancelled: AtomicBool::new(false),
        });
        let id = wait.id;
        self.state.lock().waits.push(wait);
        id
    }

    /// 取消一个等待者（包括正在派发中的），返回是否找到
    pub fn cancel(&self, id: WaitId) -> bool {
        let found = {
            let mut state = self.state.lock();
            let pending = state
                .waits
                .iter()
                .position(|wait| wait.id == id)
                .map(|index| state.waits.remove(index));
            pending.or_else(|| state.firing.iter().find(|wait| wait.id == id).cloned())
        };
        match found {
            Some(wait) => {
                wait.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消所有等待者并清除到期时间
    pub fn cancel_all(&self) -> usize {
        let cancelled = {
            let mut state = self.state.lock();
            state.expiry = None;
            let mut all = mem::take(&mut state.waits);
            all.extend(state.firing.iter().cloned());
            all
        };
        for wait in &cancelled {
            wait.cancel();
        }
        cancelled.len()
    }

    /// 是否有等待者在等待一个到期时间
    pub fn is_waiting(&self) -> bool {
        let state = self.state.lock();
        state.expiry.is_some() && !state.waits.is_empty()
    }

    /// 到期处理：到期则调用全部等待者，返回是否触发
    ///
    /// 等待者列表先在锁内整体取出再逐个调用；回调中对本对象的新等待进入新列表，
    /// 回调中取消的等待者在被调用前跳过。
    pub fn poll(&self, now: Instant) -> bool {
        let fired = {
            let mut state = self.state.lock();
            match state.expiry {
                Some(expiry) if expiry <= now && !state.waits.is_empty() => {
                    state.expiry = None;
                    let fired = mem::take(&mut state.waits);
                    state.firing = fired.clone();
                    fired
                }
                _ => return false,
            }
        };

        trace!(timer_object = self.id, waits = fired.len(), "Timer object expired");
        for wait in &fired {
            if wait.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let callback = wait.callback.lock().take();
            if let Some(callback) = callback {
                callback();
            }
        }

        self.state
            .lock()
            .firing
            .retain(|wait| !fired.iter().any(|done| Arc::ptr_eq(done, wait)));
        true
    }
}

impl fmt::Debug for TimerObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TimerObject")
            .field("id", &self.id)
            .field("expiry", &state.expiry)
            .field("waits", &state.waits.len())
            .finish()
    }
}

/// 定时器服务
pub struct TimerService {
    objects: Mutex<Vec<Weak<TimerObject>>>,
    lifetime: Lifetime,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(Vec::new()),
            lifetime: Lifetime::new_alive(),
        })
    }

    /// 创建一个由本服务轮询的定时器对象
    pub fn create_timer_object(&self) -> Arc<TimerObject> {
        let object = Arc::new(TimerObject::new());
        let mut objects = self.objects.lock();
        objects.retain(|entry| entry.strong_count() > 0);
        objects.push(Arc::downgrade(&object));
        object
    }

    /// 以当前时间轮询
    pub fn poll(&self) -> bool {
        self.poll_at(Instant::now())
    }

    /// 以指定时间轮询所有定时器对象，返回是否有对象触发
    pub fn poll_at(&self, now: Instant) -> bool {
        if !self.lifetime.is_alive() {
            return false;
        }
        let snapshot: Vec<Arc<TimerObject>> = {
            let mut objects = self.objects.lock();
            objects.retain(|entry| entry.strong_count() > 0);
            objects.iter().filter_map(Weak::upgrade).collect()
        };

        let mut fired = false;
        for object in snapshot {
            if object.poll(now) {
                fired = true;
            }
        }
        fired
    }

    /// 最早的到期时间
    pub fn next_expiry(&self) -> Option<Instant> {
        let snapshot: Vec<Arc<TimerObject>> = self
            .objects
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        snapshot
            .iter()
            .filter(|object| object.is_waiting())
            .filter_map(|object| object.expiry())
            .min()
    }

    pub fn timer_object_count(&self) -> usize {
        self.objects
            .lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// 服务生命周期标志，定时器据此判断所属任务是否正在销毁
    pub fn lifetime_flag(&self) -> LifetimeFlag {
        self.lifetime.flag()
    }

    /// 停止服务：取消所有等待，之后的轮询不再触发
    pub fn shutdown(&self) {
        if self.lifetime.set_destroying().is_err() {
            return;
        }
        let snapshot: Vec<Arc<TimerObject>> = self
            .objects
            .lock()
            .drain(..)
            .filter_map(|entry| entry.upgrade())
            .collect();
        let cancelled: usize = snapshot.iter().map(|object| object.cancel_all()).sum();
        let _ = self.lifetime.set_destroyed();
        debug!(cancelled, "Timer service shut down");
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("timer_objects", &self.timer_object_count())
            .field("lifetime", &self.lifetime.state())
            .finish()
    }
}
