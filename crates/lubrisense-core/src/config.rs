//! 应用配置和持久化
//!
//! 设置以 TOML 保存在 `<config_dir>/lubrisense/settings.toml`，文件缺失或
//! 无法解析时使用默认值。

use crate::ble::{
    Backoff, CHARACTERISTIC_UUID, DEVICE_NAME_FILTER, RetryPolicy, SERVICE_UUID, ScanFilter,
    SessionConfig,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// BLE 会话参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// 广播名称过滤子串，留空则只按服务 UUID 过滤
    pub name_filter: String,
    pub connect_timeout_ms: u64,
    pub connect_attempts: u32,
    /// 第 n 次失败后等待 n × backoff
    pub connect_backoff_ms: u64,
    /// 重试等待增加随机抖动
    pub retry_jitter: bool,
    pub settle_delay_ms: u64,
    pub locate_timeout_ms: u64,
    pub resolve_attempts: u32,
    pub resolve_delay_ms: u64,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for BleSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            name_filter: DEVICE_NAME_FILTER.to_string(),
            connect_timeout_ms: 10_000,
            connect_attempts: 3,
            connect_backoff_ms: 1_000,
            retry_jitter: false,
            settle_delay_ms: 500,
            locate_timeout_ms: 10_000,
            resolve_attempts: 3,
            resolve_delay_ms: 500,
            chunk_size: session.chunk_size,
            chunk_delay_ms: session.chunk_delay.as_millis() as u64,
            max_frame_bytes: session.max_frame_bytes,
        }
    }
}

impl BleSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retry: RetryPolicy::new(
                self.connect_attempts.max(1),
                Backoff::Linear(Duration::from_millis(self.connect_backoff_ms)),
            )
            .with_jitter(self.retry_jitter),
            resolve_retry: RetryPolicy::new(
                self.resolve_attempts.max(1),
                Backoff::Fixed(Duration::from_millis(self.resolve_delay_ms)),
            ),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            locate_timeout: Duration::from_millis(self.locate_timeout_ms),
            chunk_size: self.chunk_size.max(1),
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    /// 名称子串或服务 UUID 任一匹配
    pub fn scan_filter(&self) -> ScanFilter {
        let name = self.name_filter.trim();
        ScanFilter {
            name_contains: (!name.is_empty()).then(|| name.to_string()),
            service_uuids: vec![self.service_uuid],
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 查询类命令（读取配置、日志）的等待时间
    pub query_timeout_ms: u64,
    /// 配置写入确认的等待时间
    pub ack_timeout_ms: u64,
    /// 默认扫描时长
    pub scan_seconds: u64,
    /// 发送配置时使用旧的裸 JSON 形式
    pub legacy_envelope: bool,
    /// 已保存设备文件；为空时使用配置目录下的 devices.json
    pub devices_file: Option<PathBuf>,
    /// 详细日志模式
    pub verbose: bool,
    pub ble: BleSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            query_timeout_ms: 15_000,
            ack_timeout_ms: 10_000,
            scan_seconds: 10,
            legacy_envelope: false,
            devices_file: None,
            verbose: false,
            ble: BleSettings::default(),
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        config_dir().join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_seconds)
    }

    pub fn devices_path(&self) -> PathBuf {
        self.devices_file
            .clone()
            .unwrap_or_else(|| config_dir().join("devices.json"))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lubrisense")
}
