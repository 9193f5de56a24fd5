//! Core Service - 持有唯一的 BLE 会话并处理 IPC 请求

use anyhow::Result;
use lubrisense_core::ble::{BleScanner, BtleplugRadio, ConnectionManager, Radio, ScanFilter};
use lubrisense_core::config::AppSettings;
use lubrisense_core::ipc::{IpcRequest, IpcResponse};
use lubrisense_core::store::DeviceStore;
use lubrisense_core::workflow::{DeviceWorkflow, LogCallback, WorkflowOptions};
use std::sync::Arc;
use std::time::Duration;

pub struct Service {
    workflow: DeviceWorkflow,
    scanner: Arc<BleScanner>,
    scan_filter: ScanFilter,
    default_scan: Duration,
}

impl Service {
    pub async fn new(settings: &AppSettings) -> Result<Self> {
        let radio = Arc::new(BtleplugRadio::new().await?);
        Ok(Self::with_radio(radio, settings))
    }

    pub fn with_radio(radio: Arc<dyn Radio>, settings: &AppSettings) -> Self {
        let scanner = Arc::new(BleScanner::new(radio.clone()));
        let manager = Arc::new(ConnectionManager::with_scanner(
            radio,
            scanner.clone(),
            settings.ble.session_config(),
        ));
        let store = DeviceStore::new(settings.devices_path());
        tracing::info!("已保存设备列表: {:?}", store.path());

        Self {
            workflow: DeviceWorkflow::new(manager, store, WorkflowOptions::from(settings)),
            scanner,
            scan_filter: settings.ble.scan_filter(),
            default_scan: settings.scan_duration(),
        }
    }

    /// 停止扫描并断开会话
    pub async fn shutdown(&self) {
        self.scanner.stop().await;
        self.workflow.manager().disconnect().await;
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("请求失败: {:#}", e);
                IpcResponse::error(format!("{:#}", e))
            }
        }
    }

    async fn dispatch(&self, request: IpcRequest) -> Result<IpcResponse> {
        let manager = self.workflow.manager();
        let callback = &LogCallback;

        Ok(match request {
            IpcRequest::Status => IpcResponse::Status {
                state: manager.state(),
                device: manager.current_device(),
                scanning: self.scanner.is_scanning().await,
            },
            IpcRequest::Scan { timeout_secs } => {
                let duration = if timeout_secs == 0 {
                    self.default_scan
                } else {
                    Duration::from_secs(timeout_secs)
                };
                tracing::info!("开始扫描设备 ({}s)...", duration.as_secs());
                let found = self.scanner.scan(self.scan_filter.clone(), duration).await?;
                self.workflow.store().roster(&found)?.into()
            }
            IpcRequest::Connect { device } => {
                self.workflow.connect(&device, callback).await?;
                IpcResponse::ok(format!("已连接 {}", device))
            }
            IpcRequest::Disconnect => {
                manager.disconnect().await;
                IpcResponse::ok("已断开")
            }
            IpcRequest::GetConfig { device } => IpcResponse::Config {
                config: self.workflow.fetch_config(&device, callback).await?,
            },
            IpcRequest::SetConfig { device, config } => IpcResponse::Saved {
                device: self.workflow.push_config(&device, config, callback).await?,
            },
            IpcRequest::GetLog { device } => IpcResponse::Logs {
                logs: self.workflow.fetch_logs(&device, callback).await?,
            },
            IpcRequest::Led { device, on } => {
                self.workflow.set_led(&device, on, callback).await?;
                IpcResponse::ok(if on { "LED 已打开" } else { "LED 已关闭" })
            }
            IpcRequest::Devices => self
                .workflow
                .store()
                .roster(&self.scanner.discovered())?
                .into(),
            IpcRequest::Save { device, details } => IpcResponse::Saved {
                device: self.workflow.save_details(&device, details)?,
            },
            IpcRequest::Forget { device } => {
                if self.workflow.forget(&device)? {
                    IpcResponse::ok(format!("已删除 {}", device))
                } else {
                    IpcResponse::error(format!("未保存的设备: {}", device))
                }
            }
        })
    }
}
