//! 消息队列
//!
//! 任意线程向异步任务投递闭包，由任务所属线程在运行循环中按 FIFO 顺序执行。

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::core::async_task::WakeSignal;

type Message = Box<dyn FnOnce() + Send>;

/// 投递到任务线程执行的消息队列
pub struct MessageQueue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    wake: Mutex<Option<Arc<WakeSignal>>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            wake: Mutex::new(None),
        }
    }

    /// 设置投递时用于唤醒所属任务的信号
    pub fn set_wake_signal(&self, signal: Option<Arc<WakeSignal>>) {
        *self.wake.lock() = signal;
    }

    /// 投递一条消息
    pub fn post<F>(&self, message: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // 发送端与接收端同生命周期，发送不会失败
        let _ = self.sender.send(Box::new(message));
        let wake = self.wake.lock().clone();
        if let Some(signal) = wake {
            signal.notify();
        }
    }

    /// 执行至多 `max_messages` 条消息（0 表示不限），返回是否执行了任何消息
    ///
    /// 消息中再投递的消息计入本轮上限。
    pub fn pump_messages(&self, max_messages: usize) -> bool {
        let mut processed = 0usize;
        while max_messages == 0 || processed < max_messages {
            match self.receiver.try_recv() {
                Ok(message) => {
                    message();
                    processed += 1;
                }
                Err(_) => break,
            }
        }
        if processed > 0 {
            trace!(processed, "Pumped messages");
        }
        processed > 0
    }

    /// 丢弃所有未执行的消息，返回丢弃数量
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn have_message(&self) -> bool {
        !self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue").field("len", &self.len()).finish()
    }
}
