//! 进程内的假无线层
//!
//! 广播列表在每次扫描时重放，之后流保持挂起；写入的分片被累积，
//! 拼成合法 JSON 时交给应答器生成通知分片。

#![allow(dead_code)]

use futures_util::{StreamExt, stream};
use lubrisense_core::ble::{
    Advertisement, AdvertisementStream, BleError, CHARACTERISTIC_UUID, CharProperties,
    CharacteristicHandle, Link, NotificationStream, Radio, SERVICE_UUID, SessionConfig, WriteMode,
    Backoff, RetryPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub const DEVICE: &str = "00000000-0000-0000-0000-a1b2c3d4e5f6";

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Default)]
pub struct FakeState {
    pub advertisements: Mutex<Vec<Advertisement>>,
    pub scan_starts: AtomicUsize,
    pub scan_stops: AtomicUsize,
    pub connects: AtomicUsize,
    /// 前 N 次连接失败
    pub connect_failures: AtomicUsize,
    /// 连接永不完成
    pub connect_hangs: AtomicBool,
    /// 前 N 次特征解析返回未找到
    pub resolve_misses: AtomicUsize,
    pub no_notify: AtomicBool,
    /// 第 N 次写入失败（从 1 开始，0 表示不失败）
    pub fail_write_at: AtomicUsize,
    pub writes: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<Vec<u8>>,
    pub commands: Mutex<Vec<String>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    responder: Mutex<Option<Responder>>,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub disconnects: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeRadio {
    pub state: Arc<FakeState>,
}

impl FakeRadio {
    pub fn with_device(identity: &str, name: &str) -> Self {
        let radio = Self::default();
        radio.advertise(identity, Some(name), vec![SERVICE_UUID]);
        radio
    }

    pub fn advertise(&self, identity: &str, name: Option<&str>, services: Vec<Uuid>) {
        self.state.advertisements.lock().unwrap().push(Advertisement {
            identity: identity.to_string(),
            local_name: name.map(str::to_string),
            services,
            rssi: Some(-60),
        });
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        *self.state.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// 推送一个通知分片；没有订阅时返回 false
    pub fn notify(&self, fragment: &[u8]) -> bool {
        match self.state.notify_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(fragment.to_vec()).is_ok(),
            None => false,
        }
    }

    /// 当前订阅的发送端，用于模拟旧会话迟到的数据
    pub fn notifier(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.state.notify_tx.lock().unwrap().clone()
    }

    /// 结束通知流，模拟外设掉线
    pub fn drop_link(&self) {
        self.state.notify_tx.lock().unwrap().take();
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Radio for FakeRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError> {
        self.state.scan_starts.fetch_add(1, Ordering::SeqCst);
        let replay = self.state.advertisements.lock().unwrap().clone();
        Ok(stream::iter(replay).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.state.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, identity: &str) -> Result<Box<dyn Link>, BleError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        if self.state.connect_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let failures = self.state.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(BleError::ConnectionFailed("link layer refused".into()));
        }

        Ok(Box::new(FakeLink {
            identity: identity.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeLink {
    identity: String,
    state: Arc<FakeState>,
}

#[async_trait::async_trait]
impl Link for FakeLink {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn resolve(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, BleError> {
        let misses = self.state.resolve_misses.load(Ordering::SeqCst);
        if misses > 0 {
            self.state.resolve_misses.store(misses - 1, Ordering::SeqCst);
            return Ok(None);
        }
        if service != SERVICE_UUID || characteristic != CHARACTERISTIC_UUID {
            return Ok(None);
        }

        Ok(Some(CharacteristicHandle {
            service,
            uuid: characteristic,
            properties: CharProperties {
                read: true,
                write: true,
                notify: !self.state.no_notify.load(Ordering::SeqCst),
                ..Default::default()
            },
        }))
    }

    async fn write(
        &self,
        _characteristic: &CharacteristicHandle,
        chunk: &[u8],
        _mode: WriteMode,
    ) -> Result<(), BleError> {
        let count = {
            let mut writes = self.state.writes.lock().unwrap();
            writes.push(chunk.to_vec());
            writes.len()
        };
        if self.state.fail_write_at.load(Ordering::SeqCst) == count {
            return Err(BleError::ConnectionFailed("write rejected".into()));
        }

        let complete = {
            let mut pending = self.state.pending.lock().unwrap();
            pending.extend_from_slice(chunk);
            if serde_json::from_slice::<serde_json::Value>(&pending).is_ok() {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        if let Some(command) = complete {
            self.state
                .commands
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&command).into_owned());
            let fragments = match self.state.responder.lock().unwrap().as_ref() {
                Some(responder) => responder(&command),
                None => Vec::new(),
            };
            if let Some(tx) = self.state.notify_tx.lock().unwrap().as_ref() {
                for fragment in fragments {
                    let _ = tx.send(fragment);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, BleError> {
        self.state.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.notify_tx.lock().unwrap() = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn unsubscribe(&self, _characteristic: &CharacteristicHandle) -> Result<(), BleError> {
        self.state.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.notify_tx.lock().unwrap().take();
        self.state.pending.lock().unwrap().clear();
        Ok(())
    }
}

/// 把文本切成固定大小的通知分片
pub fn fragments(text: &str, size: usize) -> Vec<Vec<u8>> {
    text.as_bytes().chunks(size).map(<[u8]>::to_vec).collect()
}

/// 缩短所有等待的会话配置
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(1),
        connect_retry: RetryPolicy::new(3, Backoff::Linear(Duration::from_millis(10))),
        resolve_retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(10))),
        settle_delay: Duration::from_millis(10),
        locate_timeout: Duration::from_millis(200),
        chunk_delay: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}
