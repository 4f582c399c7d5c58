//! 事件 / 槽 / 接收器
//!
//! 进程内发布订阅原语。[`Event`] 按订阅顺序持有槽的弱引用；每个槽包装一个回调、
//! 一个归属线程（或"在触发线程运行"）以及一个 `stateless` 标志；
//! [`Subscription`] 拥有槽本身，丢弃即退订；[`Sink`] 是一组订阅的 RAII 集合。
//!
//! 同步触发先在锁内拍摄槽列表快照，释放锁后再调用回调，因此回调内部的订阅、
//! 退订、重入触发都不会破坏外层迭代。归属线程与触发线程不同的槽总是被推迟到
//! 归属线程的 [`AsyncEventQueue`]，即使通过 `sync_trigger` 触发也不会阻塞等待。

use crate::core::async_event_queue::{AsyncEventQueue, QueuedCall, TransactionId};
use crate::core::lifetime::{Lifetime, LifetimeFlag};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ops::AddAssign;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};
use uuid::Uuid;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // 每层递归一个帧，按需增长；accept() 标记最内层匹配事件的帧
    static DISPATCH_FRAMES: RefCell<Vec<DispatchFrame>> = const { RefCell::new(Vec::new()) };
}

/// 事件标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    fn next() -> Self {
        Self(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 槽标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u64);

impl SlotId {
    fn next() -> Self {
        Self(NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 订阅者唯一标识，用于按订阅者批量退订
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// 随机生成
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriberId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// 触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerType {
    /// 同线程直接调用，跨线程入队
    #[default]
    Synchronous,
    /// 同 `Synchronous`，跨线程入队时合并重复调用
    SynchronousDontQueue,
    /// 所有槽都入队到各自的归属线程
    Asynchronous,
    /// 同 `Asynchronous`，入队时合并重复调用
    AsynchronousDontQueue,
}

/// 触发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    /// 没有槽接受该事件（或事件在派发中被销毁）
    Unaccepted,
    /// 某个槽调用了 `accept()`，后续槽未被调用
    Accepted,
    /// 异步触发，结果未知
    Unknown,
}

/// 槽的线程亲和性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAffinity {
    /// 在触发者所在线程运行
    Emitter,
    /// 在指定线程运行
    Thread(ThreadId),
}

#[derive(Clone)]
enum SlotHome {
    Emitter,
    Thread {
        id: ThreadId,
        queue: Weak<AsyncEventQueue>,
    },
}

/// 订阅选项
#[derive(Clone, Default)]
pub struct SlotOptions {
    subscriber: Option<SubscriberId>,
    queue: Option<Arc<AsyncEventQueue>>,
    emitter_thread: bool,
    stateless: bool,
}

impl SlotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关联订阅者标识
    pub fn subscriber(mut self, id: SubscriberId) -> Self {
        self.subscriber = Some(id);
        self
    }

    /// 指定归属线程的事件队列（默认为订阅时所在线程）
    pub fn on_queue(mut self, queue: &Arc<AsyncEventQueue>) -> Self {
        self.queue = Some(Arc::clone(queue));
        self
    }

    /// 在触发线程运行
    pub fn in_emitter_thread(mut self) -> Self {
        self.emitter_thread = true;
        self
    }

    /// 无状态槽：队列中重复的调用被合并为最新的一次
    pub fn stateless(mut self, stateless: bool) -> Self {
        self.stateless = stateless;
        self
    }
}

impl fmt::Debug for SlotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotOptions")
            .field("subscriber", &self.subscriber)
            .field("queue", &self.queue.as_ref().map(|q| q.owner()))
            .field("emitter_thread", &self.emitter_thread)
            .field("stateless", &self.stateless)
            .finish()
    }
}

type SlotCallback<A> = Box<dyn Fn(&A) + Send + Sync>;

struct SlotInner<A> {
    id: SlotId,
    subscriber: Option<SubscriberId>,
    callback: SlotCallback<A>,
    home: SlotHome,
    stateless: AtomicBool,
    lifetime: Lifetime,
    event: Weak<EventInner<A>>,
}

impl<A> SlotInner<A> {
    fn runs_inline(&self, current: ThreadId) -> bool {
        match &self.home {
            SlotHome::Emitter => true,
            SlotHome::Thread { id, .. } => *id == current,
        }
    }

    fn target_queue(&self) -> Option<Arc<AsyncEventQueue>> {
        match &self.home {
            SlotHome::Emitter => Some(AsyncEventQueue::current()),
            SlotHome::Thread { queue, .. } => queue.upgrade(),
        }
    }

    fn affinity(&self) -> SlotAffinity {
        match &self.home {
            SlotHome::Emitter => SlotAffinity::Emitter,
            SlotHome::Thread { id, .. } => SlotAffinity::Thread(*id),
        }
    }

    /// 标记槽死亡并从事件中移除
    fn destroy(&self) {
        if self.lifetime.is_destroyed() {
            return;
        }
        let _ = self.lifetime.set_destroyed();
        if let Some(event) = self.event.upgrade() {
            event.remove_slot(self);
        }
    }
}

struct SlotList<A> {
    entries: Vec<Weak<SlotInner<A>>>,
    // 通过 Subscription::detach 交给事件托管的槽
    owned: Vec<Arc<SlotInner<A>>>,
}

struct EventInner<A> {
    id: EventId,
    slots: Mutex<SlotList<A>>,
    trigger_type: Mutex<TriggerType>,
    lifetime: Lifetime,
}

impl<A> EventInner<A> {
    fn remove_slot(&self, target: &SlotInner<A>) {
        let released = {
            let mut slots = self.slots.lock();
            slots
                .entries
                .retain(|entry| entry.strong_count() > 0 && !ptr::eq(entry.as_ptr(), target));
            let (released, kept): (Vec<_>, Vec<_>) = mem::take(&mut slots.owned)
                .into_iter()
                .partition(|slot| slot.id == target.id);
            slots.owned = kept;
            released
        };
        // 回调捕获的值在锁外释放
        drop(released);
    }

    fn detach(&self, slot: Arc<SlotInner<A>>) {
        if self.lifetime.is_alive() {
            self.slots.lock().owned.push(slot);
        }
    }

    fn unsubscribe_all(&self) {
        let (entries, owned) = {
            let mut slots = self.slots.lock();
            (mem::take(&mut slots.entries), mem::take(&mut slots.owned))
        };
        for slot in entries.iter().filter_map(Weak::upgrade) {
            let _ = slot.lifetime.set_destroyed();
        }
        drop(owned);
    }

    fn destroy(&self) {
        if self.lifetime.is_destroyed() {
            return;
        }
        let _ = self.lifetime.set_destroying();
        self.unsubscribe_all();
        let _ = self.lifetime.set_destroyed();
        trace!(event = self.id.value(), "Event destroyed");
    }
}

impl<A: Clone + Send + 'static> EventInner<A> {
    fn new(trigger_type: TriggerType) -> Self {
        Self {
            id: EventId::next(),
            slots: Mutex::new(SlotList {
                entries: Vec::new(),
                owned: Vec::new(),
            }),
            trigger_type: Mutex::new(trigger_type),
            lifetime: Lifetime::new_alive(),
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        options: SlotOptions,
        callback: SlotCallback<A>,
    ) -> Subscription<A> {
        let home = if options.emitter_thread {
            SlotHome::Emitter
        } else {
            let queue = options.queue.unwrap_or_else(AsyncEventQueue::current);
            SlotHome::Thread {
                id: queue.owner(),
                queue: Arc::downgrade(&queue),
            }
        };

        let slot = Arc::new(SlotInner {
            id: SlotId::next(),
            subscriber: options.subscriber,
            callback,
            home,
            stateless: AtomicBool::new(options.stateless),
            lifetime: Lifetime::new_alive(),
            event: Arc::downgrade(self),
        });

        {
            let mut slots = self.slots.lock();
            slots.entries.retain(|entry| entry.strong_count() > 0);
            slots.entries.push(Arc::downgrade(&slot));
        }
        trace!(event = self.id.value(), slot = slot.id.value(), "Slot subscribed");

        Subscription { slot: Some(slot) }
    }

    fn snapshot(&self) -> Vec<Arc<SlotInner<A>>> {
        self.slots
            .lock()
            .entries
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn unsubscribe(&self, subscriber: &SubscriberId) -> bool {
        let victims: Vec<Arc<SlotInner<A>>> = self
            .snapshot()
            .into_iter()
            .filter(|slot| slot.subscriber.as_ref() == Some(subscriber))
            .collect();
        for slot in &victims {
            slot.destroy();
        }
        !victims.is_empty()
    }

    fn trigger(self: &Arc<Self>, args: A) -> TriggerResult {
        let trigger_type = *self.trigger_type.lock();
        match trigger_type {
            TriggerType::Synchronous => self.sync_trigger(args, false),
            TriggerType::SynchronousDontQueue => self.sync_trigger(args, true),
            TriggerType::Asynchronous => self.async_trigger(args, false),
            TriggerType::AsynchronousDontQueue => self.async_trigger(args, true),
        }
    }

    fn sync_trigger(self: &Arc<Self>, args: A, no_duplicates: bool) -> TriggerResult {
        if !self.lifetime.is_alive() {
            return TriggerResult::Unaccepted;
        }
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return TriggerResult::Unaccepted;
        }

        let current = thread::current().id();
        let transaction = TransactionId::next();
        let frame = FrameGuard::enter(self.id);

        for slot in &snapshot {
            // 在本次派发中途被退订的槽
            if !slot.lifetime.is_alive() {
                continue;
            }
            if !slot.runs_inline(current) {
                self.enqueue(slot, args.clone(), no_duplicates, transaction);
                continue;
            }

            (slot.callback)(&args);

            if !self.lifetime.is_alive() {
                debug!(event = self.id.value(), "Event destroyed during dispatch");
                return TriggerResult::Unaccepted;
            }
            if frame.accepted() {
                return TriggerResult::Accepted;
            }
        }
        TriggerResult::Unaccepted
    }

    fn async_trigger(self: &Arc<Self>, args: A, no_duplicates: bool) -> TriggerResult {
        if !self.lifetime.is_alive() {
            return TriggerResult::Unaccepted;
        }
        let transaction = TransactionId::next();
        for slot in self.snapshot().iter().filter(|slot| slot.lifetime.is_alive()) {
            self.enqueue(slot, args.clone(), no_duplicates, transaction);
        }
        TriggerResult::Unknown
    }

    fn enqueue(
        &self,
        slot: &Arc<SlotInner<A>>,
        args: A,
        no_duplicates: bool,
        transaction: TransactionId,
    ) {
        let Some(queue) = slot.target_queue() else {
            trace!(
                event = self.id.value(),
                slot = slot.id.value(),
                "Target thread queue is gone; dropping slot call"
            );
            return;
        };

        let event_id = self.id;
        let weak_slot = Arc::downgrade(slot);
        let call = QueuedCall {
            event: self.id,
            event_alive: self.lifetime.flag(),
            slot: slot.id,
            slot_alive: slot.lifetime.flag(),
            callback: Box::new(move || {
                if let Some(slot) = weak_slot.upgrade() {
                    let _frame = FrameGuard::enter(event_id);
                    (slot.callback)(&args);
                }
            }),
            transaction,
        };
        let coalesce = no_duplicates || slot.stateless.load(Ordering::Acquire);
        queue.enqueue(call, coalesce);
    }

}

struct DispatchFrame {
    event: EventId,
    accepted: bool,
}

struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    fn enter(event: EventId) -> Self {
        let depth = DISPATCH_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(DispatchFrame {
                event,
                accepted: false,
            });
            frames.len() - 1
        });
        Self { depth }
    }

    fn accepted(&self) -> bool {
        DISPATCH_FRAMES.with(|frames| {
            frames
                .borrow()
                .get(self.depth)
                .is_some_and(|frame| frame.accepted)
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        DISPATCH_FRAMES.with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

fn mark_accepted(event: EventId, accepted: bool) -> bool {
    DISPATCH_FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        match frames.iter_mut().rev().find(|frame| frame.event == event) {
            Some(frame) => {
                frame.accepted = accepted;
                true
            }
            None => false,
        }
    })
}

fn is_accepted(event: EventId) -> bool {
    DISPATCH_FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .rev()
            .find(|frame| frame.event == event)
            .is_some_and(|frame| frame.accepted)
    })
}

/// 类型化事件，随其所属对象创建和销毁
///
/// `A` 是参数类型（多个参数使用元组）。跨线程派发时参数按值克隆。
pub struct Event<A> {
    inner: Arc<EventInner<A>>,
}

impl<A: Clone + Send + 'static> Event<A> {
    /// 创建同步触发的事件
    pub fn new() -> Self {
        Self::with_trigger_type(TriggerType::Synchronous)
    }

    /// 以指定触发方式创建事件
    pub fn with_trigger_type(trigger_type: TriggerType) -> Self {
        Self {
            inner: Arc::new(EventInner::new(trigger_type)),
        }
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    pub fn trigger_type(&self) -> TriggerType {
        *self.inner.trigger_type.lock()
    }

    pub fn set_trigger_type(&self, trigger_type: TriggerType) {
        *self.inner.trigger_type.lock() = trigger_type;
    }

    /// 非拥有的事件句柄
    pub fn handle(&self) -> EventRef<A> {
        EventRef {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    /// 事件自身的生命周期标志
    pub fn lifetime_flag(&self) -> LifetimeFlag {
        self.inner.lifetime.flag()
    }

    /// 订阅，归属线程为当前线程
    pub fn subscribe<F>(&self, callback: F) -> Subscription<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.inner.subscribe(SlotOptions::new(), Box::new(callback))
    }

    /// 以订阅者标识订阅，之后可通过 [`Event::unsubscribe`] 退订
    pub fn subscribe_with_id<F>(&self, subscriber: SubscriberId, callback: F) -> Subscription<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.inner
            .subscribe(SlotOptions::new().subscriber(subscriber), Box::new(callback))
    }

    /// 订阅，归属线程为 `queue` 所属线程
    pub fn subscribe_on<F>(&self, queue: &Arc<AsyncEventQueue>, callback: F) -> Subscription<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.inner
            .subscribe(SlotOptions::new().on_queue(queue), Box::new(callback))
    }

    /// 订阅，回调总是在触发线程运行
    pub fn subscribe_in_emitter_thread<F>(&self, callback: F) -> Subscription<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.inner
            .subscribe(SlotOptions::new().in_emitter_thread(), Box::new(callback))
    }

    /// 以完整选项订阅
    pub fn subscribe_with<F>(&self, options: SlotOptions, callback: F) -> Subscription<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.inner.subscribe(options, Box::new(callback))
    }

    /// 退订该订阅者的所有槽，返回是否有槽被移除
    pub fn unsubscribe(&self, subscriber: &SubscriberId) -> bool {
        self.inner.unsubscribe(subscriber)
    }

    /// 退订所有槽
    pub fn unsubscribe_all(&self) {
        self.inner.unsubscribe_all();
    }

    /// 按触发方式触发
    pub fn trigger(&self, args: A) -> TriggerResult {
        self.inner.trigger(args)
    }

    /// 同步触发：同线程槽直接调用，跨线程槽入队
    pub fn sync_trigger(&self, args: A) -> TriggerResult {
        self.inner.sync_trigger(args, false)
    }

    /// 异步触发：所有槽入队到各自归属线程
    pub fn async_trigger(&self, args: A) -> TriggerResult {
        self.inner.async_trigger(args, false)
    }

    /// 在槽回调内部调用：接受事件，阻止后续槽
    pub fn accept(&self) {
        if !mark_accepted(self.inner.id, true) {
            debug!(event = self.inner.id.value(), "accept() called outside of dispatch");
        }
    }

    /// 在槽回调内部调用：撤销接受
    pub fn ignore(&self) {
        mark_accepted(self.inner.id, false);
    }

    /// 当前派发是否已被接受
    pub fn accepted(&self) -> bool {
        is_accepted(self.inner.id)
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

impl<A: Clone + Send + 'static> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Drop for Event<A> {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl<A> fmt::Debug for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("trigger_type", &*self.inner.trigger_type.lock())
            .field("lifetime", &self.inner.lifetime.state())
            .finish()
    }
}

/// 非拥有的事件句柄
///
/// 可跨线程克隆传递；所属 [`Event`] 被丢弃后，触发返回 `Unaccepted`，订阅返回 `None`。
pub struct EventRef<A> {
    inner: Weak<EventInner<A>>,
    id: EventId,
}

impl<A: Clone + Send + 'static> EventRef<A> {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.lifetime.is_alive())
    }

    pub fn trigger(&self, args: A) -> TriggerResult {
        match self.inner.upgrade() {
            Some(inner) => inner.trigger(args),
            None => TriggerResult::Unaccepted,
        }
    }

    pub fn sync_trigger(&self, args: A) -> TriggerResult {
        match self.inner.upgrade() {
            Some(inner) => inner.sync_trigger(args, false),
            None => TriggerResult::Unaccepted,
        }
    }

    pub fn async_trigger(&self, args: A) -> TriggerResult {
        match self.inner.upgrade() {
            Some(inner) => inner.async_trigger(args, false),
            None => TriggerResult::Unaccepted,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Option<Subscription<A>>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.subscribe_with(SlotOptions::new(), callback)
    }

    pub fn subscribe_with<F>(&self, options: SlotOptions, callback: F) -> Option<Subscription<A>>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let inner = self.inner.upgrade()?;
        if !inner.lifetime.is_alive() {
            return None;
        }
        Some(inner.subscribe(options, Box::new(callback)))
    }

    pub fn unsubscribe(&self, subscriber: &SubscriberId) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.unsubscribe(subscriber))
    }

    pub fn accept(&self) {
        mark_accepted(self.id, true);
    }

    pub fn ignore(&self) {
        mark_accepted(self.id, false);
    }
}

impl<A> Clone for EventRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
            id: self.id,
        }
    }
}

impl<A> fmt::Debug for EventRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRef").field("id", &self.id).finish()
    }
}

/// 一个订阅：拥有槽，丢弃即退订
#[must_use = "dropping a subscription unsubscribes its slot"]
pub struct Subscription<A> {
    slot: Option<Arc<SlotInner<A>>>,
}

impl<A> Subscription<A> {
    /// 把槽交给事件托管，槽将与事件同生共死
    pub fn detach(mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(event) = slot.event.upgrade() {
                event.detach(slot);
            }
        }
    }

    pub fn id(&self) -> Option<SlotId> {
        self.slot.as_ref().map(|slot| slot.id)
    }

    pub fn subscriber(&self) -> Option<SubscriberId> {
        self.slot.as_ref().and_then(|slot| slot.subscriber)
    }

    pub fn affinity(&self) -> Option<SlotAffinity> {
        self.slot.as_ref().map(|slot| slot.affinity())
    }

    /// 槽仍然订阅在一个存活的事件上
    pub fn is_active(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.lifetime.is_alive())
    }

    pub fn stateless(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.stateless.load(Ordering::Acquire))
    }

    pub fn set_stateless(&self, stateless: bool) {
        if let Some(slot) = &self.slot {
            slot.stateless.store(stateless, Ordering::Release);
        }
    }

    /// 显式退订；等同于丢弃订阅
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<A> Drop for Subscription<A> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.destroy();
        }
    }
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("slot", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

trait SinkEntry: Send {
    fn slot_id(&self) -> Option<SlotId>;
    fn is_active(&self) -> bool;
}

impl<A: Send + 'static> SinkEntry for Subscription<A>
where
    Subscription<A>: Send,
{
    fn slot_id(&self) -> Option<SlotId> {
        self.id()
    }

    fn is_active(&self) -> bool {
        Subscription::is_active(self)
    }
}

/// 订阅的 RAII 集合，丢弃或清空时退订其中所有槽
#[derive(Default)]
pub struct Sink {
    subscriptions: Vec<Box<dyn SinkEntry>>,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<A: Send + 'static>(&mut self, subscription: Subscription<A>)
    where
        Subscription<A>: Send,
    {
        self.subscriptions.push(Box::new(subscription));
    }

    /// 退订所有槽
    pub fn clear(&mut self) {
        let subscriptions = mem::take(&mut self.subscriptions);
        drop(subscriptions);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// 仍处于订阅状态的槽数量
    pub fn active(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.is_active())
            .count()
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.subscriptions
            .iter()
            .filter_map(|subscription| subscription.slot_id())
            .collect()
    }
}

impl<A: Send + 'static> AddAssign<Subscription<A>> for Sink
where
    Subscription<A>: Send,
{
    fn add_assign(&mut self, subscription: Subscription<A>) {
        self.push(subscription);
    }
}

impl<A: Send + 'static> From<Subscription<A>> for Sink
where
    Subscription<A>: Send,
{
    fn from(subscription: Subscription<A>) -> Self {
        let mut sink = Sink::new();
        sink.push(subscription);
        sink
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("subscriptions", &self.subscriptions.len())
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&i32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |name: &str| -> Box<dyn Fn(&i32) + Send + Sync> {
            let log = Arc::clone(&log_clone);
            let name = name.to_string();
            Box::new(move |value: &i32| log.lock().push(format!("{name}:{value}")))
        };
        (log, make)
    }

    #[test]
    fn test_slots_called_in_subscription_order() {
        let event = Event::<i32>::new();
        let (log, make) = recorder();

        let _a = event.subscribe(make("a"));
        let _b = event.subscribe(make("b"));
        let _c = event.subscribe(make("c"));

        assert_eq!(event.trigger(7), TriggerResult::Unaccepted);
        assert_eq!(*log.lock(), vec!["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn test_accept_stops_dispatch() {
        let event = Arc::new(Event::<i32>::new());
        let (log, make) = recorder();

        let _a = event.subscribe(make("a"));
        let event_clone = Arc::clone(&event);
        let log_clone = Arc::clone(&log);
        let _b = event.subscribe(move |value| {
            log_clone.lock().push(format!("b:{value}"));
            event_clone.accept();
        });
        let _c = event.subscribe(make("c"));

        assert_eq!(event.trigger(1), TriggerResult::Accepted);
        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);

        // 下一次触发重新开始
        log.lock().clear();
        assert_eq!(event.trigger(2), TriggerResult::Accepted);
        assert_eq!(*log.lock(), vec!["a:2", "b:2"]);
    }

    #[test]
    fn test_drop_subscription_unsubscribes() {
        let event = Event::<i32>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let subscription = event.subscribe(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(event.subscriber_count(), 1);
        drop(subscription);

        assert_eq!(event.subscriber_count(), 0);
        event.trigger(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_unsubscribe_removes_slot() {
        let event = Event::<i32>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let subscription = event.subscribe(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        event.trigger(1);
        subscription.unsubscribe();

        assert_eq!(event.subscriber_count(), 0);
        event.trigger(2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_by_subscriber_id() {
        let event = Event::<i32>::new();
        let (log, make) = recorder();
        let owner = SubscriberId::new();

        let first = event.subscribe_with_id(owner, make("x"));
        let second = event.subscribe_with_id(owner, make("y"));
        let _other = event.subscribe(make("z"));

        assert!(event.unsubscribe(&owner));
        assert!(!first.is_active());
        assert!(!second.is_active());
        assert!(!event.unsubscribe(&owner));

        event.trigger(3);
        assert_eq!(*log.lock(), vec!["z:3"]);
    }

    #[test]
    fn test_sink_teardown_unsubscribes_everything() {
        let event = Event::<i32>::new();
        let other = Event::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut sink = Sink::new();
        let c1 = Arc::clone(&counter);
        sink += event.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&counter);
        sink += other.subscribe(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.active(), 2);

        event.trigger(1);
        other.trigger("hello".to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(sink);
        event.trigger(1);
        other.trigger("again".to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_inside_callback_skips_later_slot() {
        let event = Event::<i32>::new();
        let (log, make) = recorder();
        let victim: Arc<Mutex<Option<Subscription<i32>>>> = Arc::new(Mutex::new(None));

        let victim_clone = Arc::clone(&victim);
        let log_clone = Arc::clone(&log);
        let _killer = event.subscribe(move |value| {
            log_clone.lock().push(format!("killer:{value}"));
            victim_clone.lock().take();
        });
        *victim.lock() = Some(event.subscribe(make("victim")));

        event.trigger(5);
        assert_eq!(*log.lock(), vec!["killer:5"]);
        assert_eq!(event.subscriber_count(), 1);
    }

    #[test]
    fn test_subscribe_inside_callback_not_in_current_snapshot() {
        let event = Arc::new(Event::<i32>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let added: Arc<Mutex<Vec<Subscription<i32>>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = event.handle();
        let counter_clone = Arc::clone(&counter);
        let added_clone = Arc::clone(&added);
        let _adder = event.subscribe(move |_| {
            let counter = Arc::clone(&counter_clone);
            if let Some(subscription) = handle.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }) {
                added_clone.lock().push(subscription);
            }
        });

        event.trigger(1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        event.trigger(2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_trigger_uses_independent_snapshot() {
        let event = Arc::new(Event::<i32>::new());
        let (log, make) = recorder();

        let handle = event.handle();
        let log_clone = Arc::clone(&log);
        let _outer = event.subscribe(move |value| {
            log_clone.lock().push(format!("first:{value}"));
            if *value > 0 {
                handle.trigger(value - 1);
            }
        });
        let _second = event.subscribe(make("second"));

        event.trigger(2);
        assert_eq!(
            *log.lock(),
            vec!["first:2", "first:1", "first:0", "second:0", "second:1", "second:2"]
        );
    }

    #[test]
    fn test_accept_in_nested_dispatch_only_affects_inner_frame() {
        let event = Arc::new(Event::<i32>::new());
        let (log, make) = recorder();

        let handle = event.handle();
        let log_clone = Arc::clone(&log);
        let _first = event.subscribe(move |value| {
            log_clone.lock().push(format!("first:{value}"));
            if *value == 1 {
                handle.trigger(0);
            } else {
                handle.accept();
            }
        });
        let _second = event.subscribe(make("second"));

        assert_eq!(event.trigger(1), TriggerResult::Unaccepted);
        assert_eq!(*log.lock(), vec!["first:1", "first:0", "second:1"]);
    }

    #[test]
    fn test_destroying_event_inside_callback_stops_dispatch() {
        let holder: Arc<Mutex<Option<Event<i32>>>> = Arc::new(Mutex::new(Some(Event::new())));
        let (log, make) = recorder();

        let (handle, _a, _b) = {
            let guard = holder.lock();
            let event = guard.as_ref().unwrap();
            let holder_clone = Arc::clone(&holder);
            let log_clone = Arc::clone(&log);
            let a = event.subscribe(move |value| {
                log_clone.lock().push(format!("destroyer:{value}"));
                holder_clone.lock().take();
            });
            let b = event.subscribe(make("after"));
            (event.handle(), a, b)
        };

        assert_eq!(handle.trigger(9), TriggerResult::Unaccepted);
        assert_eq!(*log.lock(), vec!["destroyer:9"]);
        assert!(!handle.is_alive());
        assert_eq!(handle.trigger(10), TriggerResult::Unaccepted);
    }

    #[test]
    fn test_event_drop_deactivates_subscriptions() {
        let event = Event::<i32>::new();
        let subscription = event.subscribe(|_| {});
        assert!(subscription.is_active());
        drop(event);
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_detached_slot_lives_with_event() {
        let event = Event::<i32>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        event
            .subscribe(move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .detach();

        event.trigger(1);
        event.trigger(2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(event.subscriber_count(), 1);
    }

    #[test]
    fn test_async_trigger_defers_until_pump() {
        let event = Event::<i32>::with_trigger_type(TriggerType::Asynchronous);
        let (log, make) = recorder();
        let _a = event.subscribe(make("a"));

        assert_eq!(event.trigger(4), TriggerResult::Unknown);
        assert!(log.lock().is_empty());

        assert!(AsyncEventQueue::current().pump_events());
        assert_eq!(*log.lock(), vec!["a:4"]);
    }

    #[test]
    fn test_dont_queue_coalesces_async_calls() {
        let event = Event::<i32>::with_trigger_type(TriggerType::AsynchronousDontQueue);
        let (log, make) = recorder();
        let _a = event.subscribe(make("a"));

        event.trigger(1);
        event.trigger(2);
        event.trigger(3);
        AsyncEventQueue::current().pump_events();
        assert_eq!(*log.lock(), vec!["a:3"]);
    }

    #[test]
    fn test_emitter_thread_slot_runs_on_triggering_thread() {
        let event = Arc::new(Event::<i32>::new());
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let _slot = event.subscribe_in_emitter_thread(move |_| {
            *seen_clone.lock() = Some(thread::current().id());
        });
        let handle = event.handle();

        let worker = thread::spawn(move || {
            handle.trigger(1);
            thread::current().id()
        })
        .join()
        .unwrap();

        assert_eq!(*seen.lock(), Some(worker));
    }

    #[test]
    fn test_unsubscribed_slot_drops_queued_call() {
        let event = Event::<i32>::with_trigger_type(TriggerType::Asynchronous);
        let (log, make) = recorder();
        let subscription = event.subscribe(make("a"));

        event.trigger(1);
        drop(subscription);
        assert!(!AsyncEventQueue::current().pump_events());
        assert!(log.lock().is_empty());
    }
}
