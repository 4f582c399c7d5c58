//! 客户端定时器
//!
//! [`Timer`] 是绑定在某个 [`TimerService`] 上的周期/一次性闹钟，可选地绑定一个上下文
//! 生命周期标志：上下文死亡后定时器自行禁用，`ready` 不再被调用。
//! [`CallbackTimer`] 是以普通闭包作为 `ready` 的特化版本。
//!
//! 状态机：`Disabled -> (enable) -> Idle -> (again) -> Waiting -> (到期) -> Idle | Disabled`

use crate::core::lifetime::{Lifetime, LifetimeFlag};
use crate::core::timer_service::{TimerObject, TimerService, WaitId};
use crate::{FoundryError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// 定时器到期处理器
pub trait TimerReady: Send + 'static {
    fn ready(&mut self, timer: &TimerHandle);
}

impl<F> TimerReady for F
where
    F: FnMut(&TimerHandle) + Send + 'static,
{
    fn ready(&mut self, timer: &TimerHandle) {
        self(timer)
    }
}

struct TimerState {
    duration: Duration,
    enabled: bool,
    waiting: bool,
    wait: Option<WaitId>,
    in_ready: bool,
    // ready() 期间调用 again() 时推迟到 ready() 返回后再布防
    rearm_after_ready: bool,
}

struct TimerInner {
    object: Arc<TimerObject>,
    service: LifetimeFlag,
    context: Option<LifetimeFlag>,
    state: Mutex<TimerState>,
    handler: Mutex<Box<dyn TimerReady>>,
    lifetime: Lifetime,
}

/// 定时器句柄，可在 `ready` 回调中操作定时器本身
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerInner>,
}

impl TimerHandle {
    /// 布防：`now + duration` 后到期
    ///
    /// 已在等待时返回 [`FoundryError::AlreadyWaiting`]；对禁用的定时器会先启用。
    pub fn again(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.waiting || state.rearm_after_ready {
            return Err(FoundryError::AlreadyWaiting);
        }
        if !self.inner.lifetime.is_alive() {
            return Ok(());
        }
        state.enabled = true;
        if state.in_ready {
            state.rearm_after_ready = true;
        } else {
            self.arm(&mut state);
        }
        Ok(())
    }

    /// 仅在仍启用时布防，返回是否布防；与 `disable()` 在同一把锁下判断
    ///
    /// 周期性回调用它续期，回调期间发生的禁用不会被撤销。
    pub fn again_if_enabled(&self) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if !state.enabled {
            return Ok(false);
        }
        if state.waiting || state.rearm_after_ready {
            return Err(FoundryError::AlreadyWaiting);
        }
        if !self.inner.lifetime.is_alive() {
            return Ok(false);
        }
        if state.in_ready {
            state.rearm_after_ready = true;
        } else {
            self.arm(&mut state);
        }
        Ok(true)
    }

    /// 未在等待时布防，已在等待时为空操作
    pub fn again_if(&self) -> Result<()> {
        if self.waiting() {
            return Ok(());
        }
        self.again()
    }

    /// 取消当前等待；未在等待时为空操作
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        self.cancel_locked(&mut state);
    }

    /// 取消并重新布防
    pub fn reset(&self) -> Result<()> {
        self.cancel();
        self.again()
    }

    /// 启用；`wait` 为真时同时布防
    pub fn enable(&self, wait: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.enabled {
                return Err(FoundryError::AlreadyEnabled);
            }
            state.enabled = true;
        }
        if wait {
            self.again()?;
        }
        Ok(())
    }

    /// 禁用并取消当前等待
    pub fn disable(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.enabled {
            return Err(FoundryError::AlreadyDisabled);
        }
        state.enabled = false;
        self.cancel_locked(&mut state);
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    pub fn disabled(&self) -> bool {
        !self.enabled()
    }

    /// 是否已布防（包括 ready 中推迟的布防）
    pub fn waiting(&self) -> bool {
        let state = self.inner.state.lock();
        state.waiting || state.rearm_after_ready
    }

    pub fn duration(&self) -> Duration {
        self.inner.state.lock().duration
    }

    /// 修改时长；`effective_immediately` 为真且正在等待时，以新时长从现在重新计时
    pub fn set_duration(&self, duration: Duration, effective_immediately: bool) {
        let mut state = self.inner.state.lock();
        state.duration = duration;
        if effective_immediately && state.waiting {
            self.inner.object.expires_from_now(duration);
        }
    }

    /// 上下文是否仍存活；未绑定上下文时恒为真
    pub fn context_alive(&self) -> bool {
        self.inner
            .context
            .as_ref()
            .map_or(true, LifetimeFlag::is_alive)
    }

    fn arm(&self, state: &mut TimerState) {
        let weak: Weak<TimerInner> = Arc::downgrade(&self.inner);
        self.inner.object.expires_from_now(state.duration);
        let id = self.inner.object.async_wait(move || {
            if let Some(inner) = weak.upgrade() {
                TimerHandle { inner }.handle_expiry();
            }
        });
        state.wait = Some(id);
        state.waiting = true;
        trace!(timer_object = self.inner.object.id(), duration = ?state.duration, "Timer armed");
    }

    fn cancel_locked(&self, state: &mut TimerState) {
        state.rearm_after_ready = false;
        state.waiting = false;
        if let Some(id) = state.wait.take() {
            self.inner.object.cancel(id);
        }
    }

    fn handle_expiry(&self) {
        if self.inner.service.is_going() || !self.inner.lifetime.is_alive() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            state.waiting = false;
            state.wait = None;
            if !self.context_alive() {
                state.enabled = false;
                debug!(
                    timer_object = self.inner.object.id(),
                    "Timer context destroyed, disabling timer"
                );
                return;
            }
            if !state.enabled {
                return;
            }
            state.in_ready = true;
        }

        self.inner.handler.lock().ready(self);

        let mut state = self.inner.state.lock();
        state.in_ready = false;
        if state.rearm_after_ready {
            state.rearm_after_ready = false;
            if state.enabled && self.inner.lifetime.is_alive() && self.context_alive() {
                self.arm(&mut state);
            }
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Timer")
            .field("duration", &state.duration)
            .field("enabled", &state.enabled)
            .field("waiting", &(state.waiting || state.rearm_after_ready))
            .finish()
    }
}

/// 定时器；丢弃时取消等待
pub struct Timer {
    handle: TimerHandle,
}

impl Timer {
    /// 创建定时器；`initial_wait` 为真时立即布防
    pub fn new<R>(service: &TimerService, duration: Duration, initial_wait: bool, handler: R) -> Self
    where
        R: TimerReady,
    {
        Self::build(service, None, duration, initial_wait, Box::new(handler))
    }

    /// 创建绑定上下文的定时器，上下文死亡后 `ready` 不再被调用
    pub fn with_context<R>(
        service: &TimerService,
        context: LifetimeFlag,
        duration: Duration,
        initial_wait: bool,
        handler: R,
    ) -> Self
    where
        R: TimerReady,
    {
        Self::build(service, Some(context), duration, initial_wait, Box::new(handler))
    }

    fn build(
        service: &TimerService,
        context: Option<LifetimeFlag>,
        duration: Duration,
        initial_wait: bool,
        handler: Box<dyn TimerReady>,
    ) -> Self {
        let handle = TimerHandle {
            inner: Arc::new(TimerInner {
                object: service.create_timer_object(),
                service: service.lifetime_flag(),
                context,
                state: Mutex::new(TimerState {
                    duration,
                    enabled: true,
                    waiting: false,
                    wait: None,
                    in_ready: false,
                    rearm_after_ready: false,
                }),
                handler: Mutex::new(handler),
                lifetime: Lifetime::new_alive(),
            }),
        };
        if initial_wait {
            let mut state = handle.inner.state.lock();
            handle.arm(&mut state);
        }
        Self { handle }
    }

    /// 可克隆的句柄
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }
}

impl Deref for Timer {
    type Target = TimerHandle;

    fn deref(&self) -> &TimerHandle {
        &self.handle
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.handle.inner.lifetime.set_destroying();
        self.handle.cancel();
        let _ = self.handle.inner.lifetime.set_destroyed();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

/// 以闭包作为到期回调的定时器
pub struct CallbackTimer {
    timer: Timer,
}

impl CallbackTimer {
    pub fn new<F>(service: &TimerService, callback: F, duration: Duration, initial_wait: bool) -> Self
    where
        F: FnMut(&TimerHandle) + Send + 'static,
    {
        Self {
            timer: Timer::new(service, duration, initial_wait, callback),
        }
    }

    pub fn with_context<F>(
        service: &TimerService,
        context: LifetimeFlag,
        callback: F,
        duration: Duration,
        initial_wait: bool,
    ) -> Self
    where
        F: FnMut(&TimerHandle) + Send + 'static,
    {
        Self {
            timer: Timer::with_context(service, context, duration, initial_wait, callback),
        }
    }
}

impl Deref for CallbackTimer {
    type Target = Timer;

    fn deref(&self) -> &Timer {
        &self.timer
    }
}

impl fmt::Debug for CallbackTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.timer.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn counter_timer(
        service: &TimerService,
        duration: Duration,
        initial_wait: bool,
    ) -> (CallbackTimer, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let timer = CallbackTimer::new(
            service,
            move |_: &TimerHandle| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            },
            duration,
            initial_wait,
        );
        (timer, counter)
    }

    fn later(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(5), true);
        assert!(timer.waiting());

        service.poll_at(later(10));
        service.poll_at(later(20));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timer.waiting());
        assert!(timer.enabled());
    }

    #[test]
    fn test_again_while_waiting_fails() {
        let service = TimerService::new();
        let (timer, _) = counter_timer(&service, Duration::from_millis(5), true);
        assert!(matches!(timer.again(), Err(FoundryError::AlreadyWaiting)));
    }

    #[test]
    fn test_again_if_is_noop_while_waiting() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(5), true);
        timer.again_if().unwrap();
        timer.again_if().unwrap();

        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_again_if_on_disabled_timer_enables_and_arms() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(5), false);
        timer.disable().unwrap();
        assert!(timer.disabled());

        timer.again_if().unwrap();
        assert!(timer.enabled());
        assert!(timer.waiting());

        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_disable_errors() {
        let service = TimerService::new();
        let (timer, _) = counter_timer(&service, Duration::from_millis(5), false);
        assert!(matches!(timer.enable(false), Err(FoundryError::AlreadyEnabled)));
        timer.disable().unwrap();
        assert!(matches!(timer.disable(), Err(FoundryError::AlreadyDisabled)));
        timer.enable(true).unwrap();
        assert!(timer.waiting());
    }

    #[test]
    fn test_disable_cancels_pending_wait() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(5), true);
        timer.disable().unwrap();
        assert!(!timer.waiting());

        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(5), true);
        timer.cancel();
        timer.cancel();
        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timer.enabled());
    }

    #[test]
    fn test_again_inside_ready_rearms_once() {
        let service = TimerService::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let timer = CallbackTimer::new(
            &service,
            move |timer: &TimerHandle| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                timer.again().unwrap();
                // 推迟的布防仍被视为等待中
                assert!(matches!(timer.again(), Err(FoundryError::AlreadyWaiting)));
            },
            Duration::from_millis(1),
            true,
        );

        service.poll_at(later(5));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(timer.waiting());

        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disable_inside_ready_is_not_undone_by_rearm() {
        let service = TimerService::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let timer = CallbackTimer::new(
            &service,
            move |timer: &TimerHandle| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                timer.disable().unwrap();
                assert!(!timer.again_if_enabled().unwrap());
            },
            Duration::from_millis(1),
            true,
        );

        service.poll_at(later(5));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(timer.disabled());
        assert!(!timer.waiting());

        service.poll_at(later(10));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        timer.enable(false).unwrap();
        assert!(timer.again_if_enabled().unwrap());
        assert!(timer.waiting());
    }

    #[test]
    fn test_dead_context_suppresses_ready() {
        let service = TimerService::new();
        let context = Lifetime::new_alive();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let timer = CallbackTimer::with_context(
            &service,
            context.flag(),
            move |_: &TimerHandle| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            true,
        );

        drop(context);
        service.poll_at(later(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timer.disabled());
        assert!(!timer.context_alive());
    }

    #[test]
    fn test_dropped_timer_never_fires() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(1), true);
        drop(timer);
        service.poll_at(later(5));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(service.timer_object_count(), 0);
    }

    #[test]
    fn test_set_duration_takes_effect_on_next_arm() {
        let service = TimerService::new();
        let (timer, counter) = counter_timer(&service, Duration::from_millis(1), false);
        timer.set_duration(Duration::from_secs(3600), false);
        assert_eq!(timer.duration(), Duration::from_secs(3600));

        timer.again().unwrap();
        service.poll_at(later(5));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timer.waiting());
    }
}
