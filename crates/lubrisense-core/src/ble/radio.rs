//! BLE 无线层抽象
//!
//! 会话核心只依赖这里的两个 trait：`Radio` 负责发现与建链，
//! `Link` 代表一条已建立的物理连接。生产环境由 [`BtleplugRadio`]
//! 实现，测试中使用进程内的假实现。
//!
//! [`BtleplugRadio`]: crate::ble::BtleplugRadio

use crate::ble::BleError;
use futures_util::stream::BoxStream;
use uuid::Uuid;

/// 一次广播（或缓存中已知设备）的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub identity: String,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// 通知分片流，每一项是一次 notification 的原始字节
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn supports_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn supports_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// 已解析的服务 + 特征引用
///
/// 只在所属 `Link` 存活期间有效，由连接管理器持有，
/// 写入器和重组器只借用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

impl CharacteristicHandle {
    /// 有应答写优先，特征只支持无应答写时退化
    pub fn preferred_write_mode(&self) -> WriteMode {
        if self.properties.write {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// 外部 BLE 无线层：发现与建链
#[async_trait::async_trait]
pub trait Radio: Send + Sync {
    /// 开始扫描，返回不带过滤的广播流
    ///
    /// 实现需要对 start/stop 做引用计数，允许一次性扫描与持续扫描重叠。
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// 建立物理连接（不含超时，超时由调用方控制）
    async fn connect(&self, identity: &str) -> Result<Box<dyn Link>, BleError>;
}

/// 一条已建立的物理连接 (PeripheralHandle)
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    fn identity(&self) -> &str;

    /// 查找特征；服务发现尚未完成时返回 `Ok(None)`
    async fn resolve(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, BleError>;

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        chunk: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, BleError>;

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<(), BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;
}
