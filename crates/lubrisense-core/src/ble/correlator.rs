//! 请求/响应关联
//!
//! 协议是单飞的：同一时刻最多一个等待中的请求，它认领发送之后到达的
//! 第一个完整消息。等待者通过 oneshot 通道直接拿到结果，超时后通道
//! 被丢弃，迟到的消息不会留给下一次调用。
//!
//! 每个会话有一个代号（generation）。通知泵在投递时带上自己的代号，
//! 代号过期的消息直接丢弃，所以断开后立刻重连也看不到旧会话的数据。

use crate::ble::reassembler::Message;
use log::{debug, trace};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

const BROADCAST_CAPACITY: usize = 32;

struct Pending {
    generation: u64,
    reply: oneshot::Sender<Message>,
}

pub struct Correlator {
    pending: Mutex<Option<Pending>>,
    generation: AtomicU64,
    broadcast: broadcast::Sender<Message>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
            broadcast,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 开始新会话，返回其代号
    pub fn begin_session(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.clear_pending();
        debug!("Correlator session {} started", generation);
        generation
    }

    /// 结束当前会话：旧代号失效，等待中的请求立即得到 `None`
    pub fn end_session(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.clear_pending() {
            debug!("Pending request abandoned by session teardown");
        }
        trace!("Correlator advanced to generation {}", generation);
    }

    fn clear_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|mut slot| slot.take().is_some())
            .unwrap_or(false)
    }

    /// 登记一个等待者，替换任何残留的旧等待者
    pub fn register(&self) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            generation: self.generation(),
            reply: tx,
        };
        if let Ok(mut slot) = self.pending.lock()
            && slot.replace(pending).is_some()
        {
            debug!("Replaced a stale pending request");
        }
        rx
    }

    pub fn deregister(&self) {
        self.clear_pending();
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// 由通知泵调用，投递一个完整消息
    ///
    /// 返回 `true` 表示该消息被等待中的请求认领。
    pub fn deliver(&self, generation: u64, message: Message) -> bool {
        if generation != self.generation() {
            debug!(
                "Dropping message from stale session {} ({} bytes)",
                generation,
                message.as_str().len()
            );
            return false;
        }

        // 无订阅者时发送失败是正常情况
        let _ = self.broadcast.send(message.clone());

        let waiter = match self.pending.lock() {
            Ok(mut slot) => match slot.take() {
                Some(p) if p.generation == generation => Some(p.reply),
                Some(_) | None => None,
            },
            Err(_) => None,
        };

        match waiter {
            Some(reply) => reply.send(message).is_ok(),
            None => {
                trace!("Unsolicited message: {}", message);
                false
            }
        }
    }

    /// 在截止时间内等待回复；超时或会话结束返回 `None`
    pub async fn wait(
        &self,
        reply: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> Option<Message> {
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) => {
                debug!("Pending request dropped before a reply arrived");
                None
            }
            Err(_) => {
                debug!("No reply within {:?}", timeout);
                self.deregister();
                None
            }
        }
    }

    /// 订阅全部入站消息（包括被请求认领的）
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.broadcast.subscribe()
    }
}
