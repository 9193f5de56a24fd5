//! Lubrisense Core Library
//!
//! 润滑器外设的 BLE 会话与消息分帧核心
//!
//! # 模块
//!
//! - **ble**: 扫描、连接状态机、分片写入、通知重组、请求/响应关联
//! - **protocol**: 固件 JSON 命令与回复
//! - **store**: 已保存设备列表
//! - **config**: 应用设置
//! - **workflow**: 读取/写入配置、读取日志、LED 测试
//! - **ipc**: 守护进程与 CLI 之间的消息
//!
//! # 使用示例
//!
//! ```ignore
//! use lubrisense_core::{BtleplugRadio, ConnectionManager, SessionConfig};
//! use std::sync::Arc;
//!
//! let radio = Arc::new(BtleplugRadio::new().await?);
//! let manager = ConnectionManager::new(radio, SessionConfig::default());
//!
//! if manager.connect(&device_id).await {
//!     let reply = manager
//!         .request_response(r#"{"comando": "get_log"}"#, Duration::from_secs(15))
//!         .await;
//! }
//! manager.disconnect().await;
//! ```

pub mod ble;
pub mod config;
pub mod ipc;
pub mod protocol;
pub mod store;
pub mod workflow;

// BLE re-exports
pub use ble::{
    BleError, BleScanner, BtleplugRadio, ConnectionManager, ConnectionState, DiscoveredDevice,
    Message, Radio, ScanFilter, SessionConfig,
};

pub use config::{AppSettings, BleSettings};
pub use protocol::{Command, DeviceConfig, LogEvent, Reply};
pub use store::{DeviceStore, SavedDevice};
pub use workflow::{DeviceWorkflow, WorkflowOptions};
