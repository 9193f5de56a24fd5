//! 已保存设备列表
//!
//! 以 JSON 数组存放在 `<config_dir>/lubrisense/devices.json`。
//! 设备标识比较忽略大小写。

use crate::ble::{DiscoveredDevice, same_identity};
use crate::protocol::DeviceConfig;
use chrono::{DateTime, Local};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Could not determine the configuration directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt device list: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedDevice {
    #[serde(rename = "Uuid")]
    pub identity: String,
    #[serde(flatten)]
    pub config: DeviceConfig,
    /// 最近一次保存时间（ISO 8601 本地时间）
    #[serde(rename = "UltimaConexao", default)]
    pub last_connected: Option<DateTime<Local>>,
}

impl SavedDevice {
    pub fn new(identity: impl Into<String>, config: DeviceConfig) -> Self {
        Self {
            identity: identity.into(),
            config,
            last_connected: None,
        }
    }

    pub fn mac_display(&self) -> String {
        mac_display(&self.identity)
    }

    /// 列表中显示的名称
    pub fn title(&self) -> &str {
        if self.config.equipment.trim().is_empty() {
            "Unnamed device"
        } else {
            &self.config.equipment
        }
    }
}

/// 把 UUID 形式标识的最后 6 字节显示为 `AA:BB:CC:DD:EE:FF`
///
/// 移动平台把蓝牙地址放在 UUID 的 node 段；非 UUID 标识返回 `invalid id`。
pub fn mac_display(identity: &str) -> String {
    match Uuid::parse_str(identity.trim()) {
        Ok(uuid) => uuid.as_bytes()[10..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"),
        Err(_) => "invalid id".to_string(),
    }
}

/// 扫描结果与已保存设备合并后的视图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub known: Vec<KnownDevice>,
    pub new: Vec<DiscoveredDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub device: SavedDevice,
    pub online: bool,
    pub rssi: Option<i16>,
}

pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认位置
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(Self::new(dir.join("lubrisense").join("devices.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<SavedDevice>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let devices: Vec<SavedDevice> = serde_json::from_str(&content)?;
        debug!("Loaded {} saved device(s) from {:?}", devices.len(), self.path);
        Ok(devices)
    }

    fn save(&self, devices: &[SavedDevice]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(devices)?)?;
        debug!("Saved {} device(s) to {:?}", devices.len(), self.path);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Result<Option<SavedDevice>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|d| same_identity(&d.identity, identity)))
    }

    /// 新增或更新设备，并记录当前时间
    pub fn upsert(&self, device: SavedDevice) -> Result<SavedDevice, StoreError> {
        let mut devices = self.load()?;
        let stamped = SavedDevice {
            last_connected: Some(Local::now()),
            ..device
        };

        match devices
            .iter_mut()
            .find(|d| same_identity(&d.identity, &stamped.identity))
        {
            Some(existing) => {
                existing.config = stamped.config.clone();
                existing.last_connected = stamped.last_connected;
            }
            None => devices.push(stamped.clone()),
        }

        self.save(&devices)?;
        Ok(stamped)
    }

    /// 返回是否真的删除了设备
    pub fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let mut devices = self.load()?;
        let before = devices.len();
        devices.retain(|d| !same_identity(&d.identity, identity));
        if devices.len() == before {
            return Ok(false);
        }
        self.save(&devices)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 已保存的设备标记在线/离线，其余发现结果归为新设备
    pub fn roster(&self, discovered: &[DiscoveredDevice]) -> Result<Roster, StoreError> {
        let saved = match self.load() {
            Ok(saved) => saved,
            Err(StoreError::Parse(e)) => {
                warn!("Ignoring unreadable device list: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let known = saved
            .into_iter()
            .map(|device| {
                let seen = discovered
                    .iter()
                    .find(|d| same_identity(&d.identity, &device.identity));
                KnownDevice {
                    online: seen.is_some(),
                    rssi: seen.and_then(|d| d.rssi),
                    device,
                }
            })
            .collect::<Vec<_>>();

        let new = discovered
            .iter()
            .filter(|d| {
                !known
                    .iter()
                    .any(|k| same_identity(&k.device.identity, &d.identity))
            })
            .cloned()
            .collect();

        Ok(Roster { known, new })
    }
}
