//! 设备工作流
//!
//! 每个操作都先确保连接（已就绪时复用），再通过关联器完成一次请求。
//! 会话核心只返回 `bool` / `Option`，这里把它们转成带上下文的错误。

use crate::ble::ConnectionManager;
use crate::config::AppSettings;
use crate::protocol::{ACK_TOKEN, Command, DeviceConfig, LogEvent, Reply, ValidationError};
use crate::store::{DeviceStore, SavedDevice};
use anyhow::{Context, bail};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// 工作流进度回调
pub trait WorkflowCallback: Send + Sync {
    fn on_status(&self, status: &str);
}

/// 把进度写入日志
pub struct LogCallback;

impl WorkflowCallback for LogCallback {
    fn on_status(&self, status: &str) {
        info!("{}", status);
    }
}

/// 工作流选项
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub query_timeout: Duration,
    pub ack_timeout: Duration,
    /// 以旧的裸 JSON 形式发送配置
    pub legacy_envelope: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::from(&AppSettings::default())
    }
}

impl From<&AppSettings> for WorkflowOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            query_timeout: settings.query_timeout(),
            ack_timeout: settings.ack_timeout(),
            legacy_envelope: settings.legacy_envelope,
        }
    }
}

fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct DeviceWorkflow {
    manager: Arc<ConnectionManager>,
    store: DeviceStore,
    options: WorkflowOptions,
}

impl DeviceWorkflow {
    pub fn new(manager: Arc<ConnectionManager>, store: DeviceStore, options: WorkflowOptions) -> Self {
        Self {
            manager,
            store,
            options,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    /// 连接到设备（已就绪时直接返回）
    pub async fn connect(&self, identity: &str, callback: &dyn WorkflowCallback) -> anyhow::Result<()> {
        callback.on_status(&format!("Connecting to {}...", identity));
        if !self.manager.connect(identity).await {
            bail!("could not connect to {}", identity);
        }
        callback.on_status("Connected");
        Ok(())
    }

    async fn query(&self, identity: &str, command: Command) -> anyhow::Result<Reply> {
        let encoded = command
            .encode()
            .with_context(|| format!("failed to encode {}", command.name()))?;
        debug!("Sending {} to {}", command.name(), identity);

        let Some(message) = self
            .manager
            .request_response(&encoded, self.options.query_timeout)
            .await
        else {
            bail!(
                "no reply to {} within {:?}",
                command.name(),
                self.options.query_timeout
            );
        };

        Ok(Reply::parse(&message))
    }

    /// 读取设备当前配置
    pub async fn fetch_config(
        &self,
        identity: &str,
        callback: &dyn WorkflowCallback,
    ) -> anyhow::Result<DeviceConfig> {
        self.connect(identity, callback).await?;
        callback.on_status("Reading configuration...");

        match self.query(identity, Command::GetConfig).await? {
            Reply::Config(config) => Ok(config),
            other => bail!("unexpected reply to get_config: {:?}", other),
        }
    }

    /// 校验、发送配置并等待确认，成功后写入本地设备列表
    pub async fn push_config(
        &self,
        identity: &str,
        config: DeviceConfig,
        callback: &dyn WorkflowCallback,
    ) -> anyhow::Result<SavedDevice> {
        if let Err(errors) = config.validate() {
            bail!("invalid configuration: {}", describe(&errors));
        }

        self.connect(identity, callback).await?;
        callback.on_status("Sending configuration...");

        let command = if self.options.legacy_envelope {
            Command::LegacyConfig(config.clone())
        } else {
            Command::SetConfig(config.clone())
        };
        let encoded = command.encode().context("failed to encode configuration")?;

        if !self
            .manager
            .request_ack(&encoded, ACK_TOKEN, self.options.ack_timeout)
            .await
        {
            bail!(
                "device did not confirm the configuration within {:?}",
                self.options.ack_timeout
            );
        }

        callback.on_status("Configuration confirmed");
        let saved = self
            .store
            .upsert(SavedDevice::new(identity, config))
            .context("configuration applied but could not be saved locally")?;
        Ok(saved)
    }

    /// 读取给油日志，最新的在前
    pub async fn fetch_logs(
        &self,
        identity: &str,
        callback: &dyn WorkflowCallback,
    ) -> anyhow::Result<Vec<LogEvent>> {
        self.connect(identity, callback).await?;
        callback.on_status("Reading history...");

        match self.query(identity, Command::GetLog).await? {
            Reply::Logs(mut logs) => {
                logs.reverse();
                info!("Received {} log event(s) from {}", logs.len(), identity);
                Ok(logs)
            }
            other => bail!("unexpected reply to get_log: {:?}", other),
        }
    }

    /// LED 测试，不等待回复
    pub async fn set_led(
        &self,
        identity: &str,
        on: bool,
        callback: &dyn WorkflowCallback,
    ) -> anyhow::Result<()> {
        self.connect(identity, callback).await?;

        let encoded = Command::Led(on).encode()?;
        if !self.manager.send(encoded.as_bytes()).await {
            bail!("failed to send LED command to {}", identity);
        }
        callback.on_status(if on { "LED on" } else { "LED off" });
        Ok(())
    }

    /// 只保存标识信息（设备名、区域等），不与设备通信
    pub fn save_details(&self, identity: &str, details: DeviceConfig) -> anyhow::Result<SavedDevice> {
        let errors = details.validate_details();
        if !errors.is_empty() {
            bail!("invalid device details: {}", describe(&errors));
        }

        // 保留已保存的给油参数
        let mut config = self
            .store
            .get(identity)?
            .map(|saved| saved.config)
            .unwrap_or_default();
        config.tag = details.tag;
        config.equipment = details.equipment;
        config.sector = details.sector;
        config.lubricant = details.lubricant;

        Ok(self.store.upsert(SavedDevice::new(identity, config))?)
    }

    pub fn forget(&self, identity: &str) -> anyhow::Result<bool> {
        Ok(self.store.remove(identity)?)
    }
}
