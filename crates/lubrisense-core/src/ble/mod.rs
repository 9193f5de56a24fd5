//! BLE 会话核心
//!
//! 扫描、连接、分片写入、通知重组以及请求/响应关联。
//!
//! ```text
//! Scanner ──┐
//!           ├── ConnectionManager ── ChunkedWriter  (出站分片)
//! Radio ────┘          │
//!                      └── FrameReassembler ── Correlator (入站消息)
//! ```

pub mod btleplug_radio;
pub mod correlator;
pub mod error;
pub mod radio;
pub mod reassembler;
pub mod retry;
pub mod scanner;
pub mod session;
pub mod transport;

use uuid::Uuid;

pub use btleplug_radio::BtleplugRadio;
pub use correlator::Correlator;
pub use error::BleError;
pub use radio::{
    Advertisement, AdvertisementStream, CharProperties, CharacteristicHandle, Link,
    NotificationStream, Radio, WriteMode,
};
pub use reassembler::{FrameReassembler, Message};
pub use retry::{Backoff, RetryPolicy};
pub use scanner::{BleScanner, DiscoveredDevice, MatchKind, ScanFilter};
pub use session::{ConnectionManager, ConnectionState, SessionConfig};
pub use transport::{ChunkedWriter, DEFAULT_CHUNK_SIZE};

/// 润滑器固件暴露的 GATT 服务
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// 读/写/通知共用的唯一特征
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x1c95d5e3_d8f7_413a_bf3d_7a2e5d7be87e);

/// 固件广播名称中包含的固定前缀
pub const DEVICE_NAME_FILTER: &str = "LUBRICENSE_Device";

/// 比较两个设备标识（平台 ID 或地址），忽略大小写
pub fn same_identity(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
