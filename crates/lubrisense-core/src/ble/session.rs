//! 连接管理器
//!
//! 进程内唯一的 BLE 会话状态机：
//!
//! ```text
//! Disconnected ──► Connecting ──► ResolvingCharacteristic ──► Ready
//!       ▲               │                    │                  │
//!       └───────────────┴──── 出错 ──────────┴──── disconnect ──┘
//! ```
//!
//! 连接、发送、请求和断开都在同一把异步锁下串行执行，单飞协议由
//! 锁保证而不是靠调用方自觉。对外接口只返回 `bool` / `Option`，
//! 底层错误在这里记录后丢弃。

use crate::ble::correlator::Correlator;
use crate::ble::radio::{CharacteristicHandle, Link, NotificationStream, Radio};
use crate::ble::reassembler::{DEFAULT_MAX_FRAME_BYTES, FrameReassembler, Message};
use crate::ble::retry::{Backoff, RetryPolicy};
use crate::ble::scanner::BleScanner;
use crate::ble::transport::{ChunkedWriter, DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_SIZE};
use crate::ble::{BleError, CHARACTERISTIC_UUID, SERVICE_UUID, same_identity};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ResolvingCharacteristic,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ResolvingCharacteristic => "resolving characteristic",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// 单次物理连接的超时
    pub connect_timeout: Duration,
    /// 整个连接流程的重试
    pub connect_retry: RetryPolicy,
    /// 特征解析的重试（服务发现常常落后于建链）
    pub resolve_retry: RetryPolicy,
    /// 拆除旧会话后的等待
    pub settle_delay: Duration,
    /// 设备不在发现结果中时一次性扫描的超时
    pub locate_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_secs(10),
            connect_retry: RetryPolicy::new(3, Backoff::Linear(Duration::from_secs(1))),
            resolve_retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(500))),
            settle_delay: Duration::from_millis(500),
            locate_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// 一个已就绪的会话，独占物理连接与特征
struct ActiveSession {
    identity: String,
    link: Box<dyn Link>,
    characteristic: CharacteristicHandle,
    subscribed: bool,
    pump: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    scanner: Arc<BleScanner>,
    config: SessionConfig,
    writer: ChunkedWriter,
    session: Mutex<Option<ActiveSession>>,
    state: Arc<watch::Sender<ConnectionState>>,
    device: Arc<std::sync::Mutex<Option<String>>>,
    correlator: Arc<Correlator>,
    /// 当前连接/会话的取消令牌，`disconnect()` 不持锁即可触发
    cancel: std::sync::Mutex<CancellationToken>,
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), BleError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BleError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

impl ConnectionManager {
    pub fn new(radio: Arc<dyn Radio>, config: SessionConfig) -> Self {
        let scanner = Arc::new(BleScanner::new(radio.clone()));
        Self::with_scanner(radio, scanner, config)
    }

    /// 与外部共享同一个扫描器，连接时可直接使用其发现结果
    pub fn with_scanner(radio: Arc<dyn Radio>, scanner: Arc<BleScanner>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            radio,
            scanner,
            writer: ChunkedWriter::new(config.chunk_size, config.chunk_delay),
            config,
            session: Mutex::new(None),
            state: Arc::new(state),
            device: Arc::new(std::sync::Mutex::new(None)),
            correlator: Arc::new(Correlator::new()),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn scanner(&self) -> &Arc<BleScanner> {
        &self.scanner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 就绪会话的设备标识
    pub fn current_device(&self) -> Option<String> {
        if self.state() != ConnectionState::Ready {
            return None;
        }
        self.device.lock().ok().and_then(|d| d.clone())
    }

    /// 全部入站消息，包括没有请求认领的主动推送
    pub fn messages(&self) -> BroadcastStream<Message> {
        BroadcastStream::new(self.correlator.subscribe())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous, state);
        }
    }

    fn fresh_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = token.clone();
        }
        token
    }

    /// 连接到指定设备，成功返回 `true`
    ///
    /// 已对同一设备就绪时直接复用，不触碰无线层。
    pub async fn connect(&self, identity: &str) -> bool {
        let mut session = self.session.lock().await;

        if let Some(active) = session.as_ref()
            && same_identity(&active.identity, identity)
            && self.state() == ConnectionState::Ready
        {
            debug!("Already connected to {}", active.identity);
            return true;
        }

        self.teardown(&mut session).await;
        let cancel = self.fresh_cancel();

        let mut attempt = 1;
        loop {
            let result = match sleep_or_cancel(self.config.settle_delay, &cancel).await {
                Ok(()) => self.establish(identity, &cancel).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(active) => {
                    info!("Connected to {}", active.identity);
                    if let Ok(mut device) = self.device.lock() {
                        *device = Some(active.identity.clone());
                    }
                    *session = Some(active);
                    self.set_state(ConnectionState::Ready);
                    return true;
                }
                Err(e) => e,
            };

            self.set_state(ConnectionState::Disconnected);
            match self.config.connect_retry.next_delay(attempt, &error) {
                Some(delay) => {
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}, retrying in {:?}",
                        attempt, self.config.connect_retry.max_attempts, identity, error, delay
                    );
                    if sleep_or_cancel(delay, &cancel).await.is_err() {
                        info!("Connect to {} cancelled", identity);
                        return false;
                    }
                    attempt += 1;
                }
                None => {
                    error!(
                        "Failed to connect to {} after {} attempt(s): {}",
                        identity, attempt, error
                    );
                    return false;
                }
            }
        }
    }

    /// 定位 → 建链 → 解析特征 → 订阅通知
    ///
    /// 链路打开后的任何失败都会先断开该链路再返回。
    async fn establish(
        &self,
        identity: &str,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession, BleError> {
        self.set_state(ConnectionState::Connecting);

        let target = self.locate(identity, cancel).await?;
        let link = self.open_link(&target, cancel).await?;

        match self.attach(link.as_ref(), cancel).await {
            Ok((characteristic, notifications)) => {
                let subscribed = notifications.is_some();
                let pump = notifications.map(|(generation, stream)| {
                    self.spawn_pump(stream, generation, target.clone(), cancel.clone())
                });
                Ok(ActiveSession {
                    identity: target,
                    link,
                    characteristic,
                    subscribed,
                    pump,
                    cancel: cancel.clone(),
                })
            }
            Err(e) => {
                if let Err(d) = link.disconnect().await {
                    debug!("Disconnect after failed attach: {}", d);
                }
                Err(e)
            }
        }
    }

    async fn locate(&self, identity: &str, cancel: &CancellationToken) -> Result<String, BleError> {
        if let Some(device) = self.scanner.lookup(identity) {
            debug!("{} found in discovery results", device.identity);
            return Ok(device.identity);
        }

        debug!("{} not in discovery results, scanning", identity);
        tokio::select! {
            _ = cancel.cancelled() => Err(BleError::Cancelled),
            found = self.scanner.find(identity, self.config.locate_timeout) => {
                found.map(|d| d.identity)
            }
        }
    }

    async fn open_link(
        &self,
        identity: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Link>, BleError> {
        let timeout = self.config.connect_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(BleError::Cancelled),
            result = tokio::time::timeout(timeout, self.radio.connect(identity)) => match result {
                Ok(link) => link,
                Err(_) => Err(BleError::ConnectTimeout(timeout)),
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn attach(
        &self,
        link: &dyn Link,
        cancel: &CancellationToken,
    ) -> Result<(CharacteristicHandle, Option<(u64, NotificationStream)>), BleError> {
        self.set_state(ConnectionState::ResolvingCharacteristic);
        let characteristic = self.resolve(link, cancel).await?;

        let generation = self.correlator.begin_session();
        if !characteristic.properties.supports_notify() {
            warn!("Characteristic {} does not notify, replies unavailable", characteristic.uuid);
            return Ok((characteristic, None));
        }

        let stream = link
            .subscribe(&characteristic)
            .await
            .map_err(|e| BleError::SubscribeFailed(e.to_string()))?;
        debug!("Subscribed to notifications on {}", characteristic.uuid);
        Ok((characteristic, Some((generation, stream))))
    }

    async fn resolve(
        &self,
        link: &dyn Link,
        cancel: &CancellationToken,
    ) -> Result<CharacteristicHandle, BleError> {
        let service = self.config.service_uuid;
        let uuid = self.config.characteristic_uuid;

        let mut attempt = 1;
        loop {
            let error = match link.resolve(service, uuid).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => BleError::CharacteristicNotFound {
                    service,
                    characteristic: uuid,
                },
                Err(e) => e,
            };

            match self.config.resolve_retry.next_delay(attempt, &error) {
                Some(delay) => {
                    debug!("Characteristic not resolved yet ({}), retrying in {:?}", error, delay);
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    /// 通知泵：分片 → 重组器 → 关联器
    fn spawn_pump(
        &self,
        mut stream: NotificationStream,
        generation: u64,
        identity: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let correlator = self.correlator.clone();
        let state = self.state.clone();
        let max_frame_bytes = self.config.max_frame_bytes;

        tokio::spawn(async move {
            let mut reassembler = FrameReassembler::new(max_frame_bytes);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    fragment = stream.next() => match fragment {
                        Some(bytes) => {
                            for message in reassembler.push(&bytes) {
                                correlator.deliver(generation, message);
                            }
                        }
                        None => {
                            // 会话仍是当前会话时，流结束意味着外设掉线
                            if correlator.generation() == generation {
                                warn!("Notification stream from {} ended, link lost", identity);
                                correlator.end_session();
                                state.send_replace(ConnectionState::Disconnected);
                            }
                            break;
                        }
                    }
                }
            }

            if !reassembler.is_idle() {
                debug!("Discarding {} unterminated byte(s)", reassembler.pending_len());
            }
        })
    }

    async fn teardown(&self, session: &mut Option<ActiveSession>) {
        self.correlator.end_session();

        if let Some(active) = session.take() {
            active.cancel.cancel();
            if let Some(pump) = active.pump {
                pump.abort();
            }
            if active.subscribed
                && let Err(e) = active.link.unsubscribe(&active.characteristic).await
            {
                debug!("Unsubscribe failed: {}", e);
            }
            if let Err(e) = active.link.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
            info!("Disconnected from {}", active.identity);
        }

        if let Ok(mut device) = self.device.lock() {
            *device = None;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// 断开当前会话；任何状态下都可以调用，重复调用无副作用
    ///
    /// 先取消会话令牌并结束关联器，使进行中的请求立即返回，再获取锁拆除。
    pub async fn disconnect(&self) {
        if let Ok(cancel) = self.cancel.lock() {
            cancel.cancel();
        }
        self.correlator.end_session();

        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;
    }

    fn ready<'a>(&self, session: &'a Option<ActiveSession>) -> Result<&'a ActiveSession, BleError> {
        match session.as_ref() {
            Some(active) if self.state() == ConnectionState::Ready => Ok(active),
            _ => Err(BleError::NotReady),
        }
    }

    /// 发送一条消息（不等待回复）
    pub async fn send(&self, payload: &[u8]) -> bool {
        let session = self.session.lock().await;
        let active = match self.ready(&session) {
            Ok(active) => active,
            Err(e) => {
                warn!("Send rejected: {}", e);
                return false;
            }
        };

        match self
            .writer
            .write(active.link.as_ref(), &active.characteristic, payload, &active.cancel)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", active.identity, e);
                false
            }
        }
    }

    /// 发送命令并等待下一个完整消息
    ///
    /// 发送失败立即返回 `None`；超时后迟到的消息被丢弃。
    pub async fn request_response(&self, command: &str, timeout: Duration) -> Option<Message> {
        let session = self.session.lock().await;
        let active = match self.ready(&session) {
            Ok(active) => active,
            Err(e) => {
                warn!("Request rejected: {}", e);
                return None;
            }
        };
        if !active.subscribed {
            warn!("Request rejected: no notification subscription");
            return None;
        }

        // 先登记再写，避免回复早于登记到达
        let reply = self.correlator.register();
        if let Err(e) = self
            .writer
            .write(
                active.link.as_ref(),
                &active.characteristic,
                command.as_bytes(),
                &active.cancel,
            )
            .await
        {
            self.correlator.deregister();
            warn!("Request to {} failed: {}", active.identity, e);
            return None;
        }

        self.correlator.wait(reply, timeout).await
    }

    /// 发送命令并等待包含 `needle` 的回复
    pub async fn request_ack(&self, command: &str, needle: &str, timeout: Duration) -> bool {
        match self.request_response(command, timeout).await {
            Some(reply) if reply.contains(needle) => true,
            Some(reply) => {
                warn!("Unexpected acknowledgement: {}", reply);
                false
            }
            None => false,
        }
    }
}
