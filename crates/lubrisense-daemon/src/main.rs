//! Lubrisense Daemon
//!
//! 后台守护进程，负责：
//! - 持有唯一的 BLE 会话（扫描、连接、命令收发）
//! - 维护已保存设备列表
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use lubrisense_core::config::AppSettings;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（lubrisense-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let settings = AppSettings::load();
    let default_filter = if settings.verbose {
        "debug"
    } else {
        "info,lubrisense_core=debug"
    };

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::info!("Lubrisense Daemon starting...");

    let service = Arc::new(service::Service::new(&settings).await?);

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(service.clone()));

    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到退出信号，正在断开...");
        }
    }

    service.shutdown().await;
    let _ = std::fs::remove_file(lubrisense_core::ipc::socket_path());

    Ok(())
}
