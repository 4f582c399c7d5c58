//! I/O 服务
//!
//! 可轮询数据源（如网络包回调）的注册表。异步任务在运行循环中调用 [`IoService::poll`]，
//! 数据源在注册表锁之外被轮询，因此数据源可以在回调中注册或注销其他数据源。

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 可轮询数据源
pub trait IoSource: Send {
    /// 数据源名称
    fn name(&self) -> &str;

    /// 处理就绪的 I/O，返回是否做了任何工作
    fn poll(&mut self) -> bool;
}

/// 数据源注册标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoSourceId(u64);

type SharedSource = Arc<Mutex<dyn IoSource>>;

/// I/O 服务
#[derive(Clone, Default)]
pub struct IoService {
    sources: Arc<Mutex<Vec<(IoSourceId, SharedSource)>>>,
    next_id: Arc<AtomicU64>,
}

impl IoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册数据源
    pub fn register<S>(&self, source: S) -> IoSourceId
    where
        S: IoSource + 'static,
    {
        let id = IoSourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(source = source.name(), "I/O source registered");
        self.sources.lock().push((id, Arc::new(Mutex::new(source))));
        id
    }

    /// 注销数据源，返回是否存在
    pub fn unregister(&self, id: IoSourceId) -> bool {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|(entry, _)| *entry != id);
        before != sources.len()
    }

    /// 轮询所有数据源，返回是否有数据源做了工作
    pub fn poll(&self) -> bool {
        let snapshot: Vec<SharedSource> = self
            .sources
            .lock()
            .iter()
            .map(|(_, source)| Arc::clone(source))
            .collect();

        let mut did_work = false;
        for source in snapshot {
            if source.lock().poll() {
                did_work = true;
            }
        }
        did_work
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }
}

impl fmt::Debug for IoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoService")
            .field("sources", &self.source_count())
            .finish()
    }
}
