//! 守护进程与 CLI 共用的 IPC 消息
//!
//! Unix Domain Socket 上的 JSON Lines：每行一个请求，每行一个响应。

use crate::ble::{ConnectionState, DiscoveredDevice};
use crate::protocol::{DeviceConfig, LogEvent};
use crate::store::{KnownDevice, Roster, SavedDevice};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("lubrisense.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Scan { timeout_secs: u64 },
    Connect { device: String },
    Disconnect,
    GetConfig { device: String },
    SetConfig { device: String, config: DeviceConfig },
    GetLog { device: String },
    Led { device: String, on: bool },
    /// 已保存设备与最近一次扫描结果
    Devices,
    /// 保存设备标识信息（不与设备通信）
    Save { device: String, details: DeviceConfig },
    Forget { device: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok {
        message: String,
    },
    Error {
        message: String,
    },
    Devices {
        known: Vec<KnownDevice>,
        new: Vec<DiscoveredDevice>,
    },
    Status {
        state: ConnectionState,
        device: Option<String>,
        scanning: bool,
    },
    Config {
        config: DeviceConfig,
    },
    Logs {
        logs: Vec<LogEvent>,
    },
    Saved {
        device: SavedDevice,
    },
}

impl From<Roster> for IpcResponse {
    fn from(roster: Roster) -> Self {
        IpcResponse::Devices {
            known: roster.known,
            new: roster.new,
        }
    }
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}
