//! 润滑器固件的 JSON 协议
//!
//! 两种信封形式并存：
//! - 当前形式 `{"comando": "...", "payload": {...}}`
//! - 旧形式：直接发送配置对象本身
//!
//! 固件字段沿用其原有的葡萄牙语 PascalCase 键名，枚举以整数传输。
//! 解析时同时接受小写键名。

use crate::ble::Message;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const CMD_GET_CONFIG: &str = "get_config";
pub const CMD_SET_CONFIG: &str = "set_config";
pub const CMD_GET_LOG: &str = "get_log";

/// 配置写入成功时固件回复中包含的子串
pub const ACK_TOKEN: &str = "OK";

/// 配置模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConfigType {
    #[default]
    Basic = 0,
    Advanced = 1,
}

impl From<ConfigType> for u8 {
    fn from(value: ConfigType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ConfigType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConfigType::Basic),
            1 => Ok(ConfigType::Advanced),
            other => Err(format!("unknown config type {}", other)),
        }
    }
}

/// 高级模式下的间隔单位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IntervalType {
    #[default]
    None = 0,
    Hour = 1,
    Day = 2,
    Month = 3,
}

impl From<IntervalType> for u8 {
    fn from(value: IntervalType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for IntervalType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IntervalType::None),
            1 => Ok(IntervalType::Hour),
            2 => Ok(IntervalType::Day),
            3 => Ok(IntervalType::Month),
            other => Err(format!("unknown interval type {}", other)),
        }
    }
}

impl IntervalType {
    pub fn label(&self) -> &'static str {
        match self {
            IntervalType::None => "none",
            IntervalType::Hour => "hour",
            IntervalType::Day => "day",
            IntervalType::Month => "month",
        }
    }
}

impl std::str::FromStr for IntervalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "nenhum" => Ok(IntervalType::None),
            "hour" | "hora" | "h" => Ok(IntervalType::Hour),
            "day" | "dia" | "d" => Ok(IntervalType::Day),
            "month" | "mes" | "mês" | "m" => Ok(IntervalType::Month),
            other => Err(format!("unknown interval type '{}'", other)),
        }
    }
}

/// 设备配置（标识信息 + 给油参数）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "Tag", alias = "tag", default)]
    pub tag: String,
    #[serde(rename = "Equipamento", alias = "equipamento", default)]
    pub equipment: String,
    #[serde(rename = "Setor", alias = "setor", default)]
    pub sector: String,
    #[serde(rename = "Lubrificante", alias = "lubrificante", default)]
    pub lubricant: String,
    /// 每次给油量
    #[serde(rename = "Volume", alias = "volume", default)]
    pub volume: f64,
    /// 基本模式下以小时计；高级模式下单位由 `interval_type` 决定
    #[serde(rename = "Intervalo", alias = "intervalo", default)]
    pub interval: i32,
    #[serde(rename = "TipoConfig", alias = "tipoConfig", default)]
    pub config_type: ConfigType,
    #[serde(rename = "TipoIntervalo", alias = "tipoIntervalo", default)]
    pub interval_type: IntervalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("equipment must not be empty")]
    MissingEquipment,

    #[error("sector must not be empty")]
    MissingSector,

    #[error("volume must be greater than zero")]
    InvalidVolume,

    #[error("interval must be greater than zero")]
    InvalidInterval,

    #[error("advanced configuration requires an interval type")]
    MissingIntervalType,
}

impl DeviceConfig {
    /// 标识信息：设备名与区域不能为空
    pub fn validate_details(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.equipment.trim().is_empty() {
            errors.push(ValidationError::MissingEquipment);
        }
        if self.sector.trim().is_empty() {
            errors.push(ValidationError::MissingSector);
        }
        errors
    }

    /// 给油参数
    pub fn validate_parameters(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.volume.is_nan() || self.volume <= 0.0 {
            errors.push(ValidationError::InvalidVolume);
        }
        if self.interval <= 0 {
            errors.push(ValidationError::InvalidInterval);
        }
        if self.config_type == ConfigType::Advanced && self.interval_type == IntervalType::None {
            errors.push(ValidationError::MissingIntervalType);
        }
        errors
    }

    /// 返回所有不合法的字段
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = self.validate_details();
        errors.extend(self.validate_parameters());
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn looks_like(value: &Value) -> bool {
        const KEYS: [&str; 8] = [
            "Equipamento",
            "equipamento",
            "Volume",
            "volume",
            "Intervalo",
            "intervalo",
            "TipoConfig",
            "tipoConfig",
        ];
        value
            .as_object()
            .is_some_and(|obj| KEYS.iter().any(|k| obj.contains_key(*k)))
    }
}

/// 当前形式的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub comando: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetConfig,
    SetConfig(DeviceConfig),
    GetLog,
    /// 旧形式：裸配置对象
    LegacyConfig(DeviceConfig),
    /// LED 测试，固件收到 `"1"` / `"0"` 时开关指示灯
    Led(bool),
    Raw(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::GetConfig => CMD_GET_CONFIG,
            Command::SetConfig(_) | Command::LegacyConfig(_) => CMD_SET_CONFIG,
            Command::GetLog => CMD_GET_LOG,
            Command::Led(_) => "led",
            Command::Raw(_) => "raw",
        }
    }

    /// 编码为线上文本
    pub fn encode(&self) -> serde_json::Result<String> {
        let envelope = |comando: &str, payload: Option<Value>| {
            serde_json::to_string(&Envelope {
                comando: comando.to_string(),
                payload,
            })
        };

        match self {
            Command::GetConfig => envelope(CMD_GET_CONFIG, None),
            Command::GetLog => envelope(CMD_GET_LOG, None),
            Command::SetConfig(config) => {
                envelope(CMD_SET_CONFIG, Some(serde_json::to_value(config)?))
            }
            Command::LegacyConfig(config) => serde_json::to_string(config),
            Command::Led(on) => Ok(if *on { "1" } else { "0" }.to_string()),
            Command::Raw(text) => Ok(text.clone()),
        }
    }
}

/// 一条给油事件记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// ISO 8601 本地时间，例如 `2025-12-05T14:30:00`
    #[serde(rename = "Hora", alias = "hora", default)]
    pub time: String,
    #[serde(rename = "Sucesso", alias = "sucesso", default)]
    pub success: bool,
    /// `"Manual"` 或 `"Auto"`
    #[serde(rename = "Modo", alias = "modo", default)]
    pub mode: String,
    #[serde(rename = "Temperatura", alias = "temperatura", default)]
    pub temperature: f64,
    #[serde(rename = "Bateria", alias = "bateria", default)]
    pub battery: i32,
    /// 是否已转发到网关
    #[serde(rename = "e", default)]
    pub sent_to_gateway: bool,
}

impl LogEvent {
    /// `dd/MM/yy HH:mm`；无法识别的时间原样返回
    pub fn formatted_time(&self) -> String {
        format_timestamp(&self.time).unwrap_or_else(|| self.time.clone())
    }

    pub fn is_manual(&self) -> bool {
        self.mode == "Manual"
    }

    pub fn mode_label(&self) -> &'static str {
        if self.is_manual() { "Manual" } else { "Auto" }
    }

    pub fn status_label(&self) -> &'static str {
        if self.success { "Success" } else { "Failure" }
    }

    pub fn gateway_label(&self) -> &'static str {
        if self.sent_to_gateway { "Sent" } else { "Pending" }
    }

    pub fn battery_label(&self) -> String {
        format!("{}%", self.battery)
    }

    pub fn temperature_label(&self) -> String {
        format!("{:.1}°C", self.temperature)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<7} {:<6} {:>7} {:>4}  {}",
            self.formatted_time(),
            self.status_label(),
            self.mode_label(),
            self.temperature_label(),
            self.battery_label(),
            self.gateway_label()
        )
    }
}

/// 固件可能发送的本地时间格式
const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn format_timestamp(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(|dt| dt.format("%d/%m/%y %H:%M").to_string())
}

/// 解析后的固件回复
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Config(DeviceConfig),
    /// 按固件顺序（最旧在前）
    Logs(Vec<LogEvent>),
    /// 含 `OK` 的确认
    Ack(String),
    Other(Value),
    /// 不是合法 JSON 的文本
    Text(String),
}

#[derive(Deserialize)]
struct LogsBody {
    logs: Vec<LogEvent>,
}

impl Reply {
    /// 两种信封都接受，不区分优先级
    pub fn parse(message: &Message) -> Reply {
        let text = message.as_str();
        let value: Value = match serde_json::from_str(text.trim()) {
            Ok(v) => v,
            Err(_) if text.contains(ACK_TOKEN) => return Reply::Ack(text.to_string()),
            Err(_) => return Reply::Text(text.to_string()),
        };

        let body = unwrap_envelope(value);

        if body.get("logs").is_some_and(Value::is_array) {
            if let Ok(parsed) = serde_json::from_value::<LogsBody>(body.clone()) {
                return Reply::Logs(parsed.logs);
            }
            return Reply::Other(body);
        }

        if let Some(config) = config_of(&body) {
            return Reply::Config(config);
        }

        if text.contains(ACK_TOKEN) {
            return Reply::Ack(text.to_string());
        }

        Reply::Other(body)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack(_))
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.contains_key("comando") => match obj.remove("payload") {
            Some(payload) if payload.is_object() => payload,
            Some(other) => {
                obj.insert("payload".into(), other);
                Value::Object(obj)
            }
            None => Value::Object(obj),
        },
        other => other,
    }
}

/// 配置对象可能直接出现，也可能包在 `{"config": [...]}` 里
fn config_of(body: &Value) -> Option<DeviceConfig> {
    let candidate = match body.get("config") {
        Some(Value::Array(items)) => items.first()?,
        Some(obj @ Value::Object(_)) => obj,
        _ => body,
    };

    if !DeviceConfig::looks_like(candidate) {
        return None;
    }
    serde_json::from_value(candidate.clone()).ok()
}
