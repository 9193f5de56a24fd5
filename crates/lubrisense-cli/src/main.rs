//! Lubrisense CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lubrisense_core::ble::DiscoveredDevice;
use lubrisense_core::ipc::{IpcRequest, IpcResponse};
use lubrisense_core::protocol::{ConfigType, DeviceConfig, IntervalType};
use lubrisense_core::store::{KnownDevice, mac_display};

#[derive(Parser)]
#[command(name = "lubrisense", version, about = "自动润滑器蓝牙配置工具")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看当前连接状态
    Status,
    /// 扫描附近的润滑器
    Scan {
        /// 扫描超时时间 (秒)，0 表示使用守护进程的默认值
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 连接设备
    Connect {
        /// 设备标识
        device: String,
    },
    /// 断开当前连接
    Disconnect,
    /// 读取或写入给油配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// 读取给油历史（最新的在前）
    Logs {
        device: String,
    },
    /// LED 测试
    Led {
        device: String,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// 列出已保存设备和最近一次扫描结果
    Devices,
    /// 保存设备标识信息（不与设备通信）
    Save {
        device: String,
        #[command(flatten)]
        details: Details,
    },
    /// 从已保存列表中删除设备
    Forget {
        device: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 读取设备当前配置
    Get { device: String },
    /// 发送新配置并等待确认
    Set {
        device: String,
        #[command(flatten)]
        details: Details,
        /// 每次给油量
        #[arg(long)]
        volume: f64,
        /// 给油间隔
        #[arg(long)]
        interval: i32,
        /// 间隔单位 (hour/day/month)，指定时使用高级模式
        #[arg(long)]
        unit: Option<IntervalType>,
    },
}

#[derive(Args)]
struct Details {
    /// 设备名称（设备所在的设备/机器）
    #[arg(long)]
    equipment: String,
    /// 区域
    #[arg(long)]
    sector: String,
    #[arg(long, default_value = "")]
    tag: String,
    #[arg(long, default_value = "")]
    lubricant: String,
}

impl Details {
    fn into_config(self) -> DeviceConfig {
        DeviceConfig {
            tag: self.tag,
            equipment: self.equipment,
            sector: self.sector,
            lubricant: self.lubricant,
            ..Default::default()
        }
    }
}

fn print_config(config: &DeviceConfig) {
    println!("   设备:   {}", config.equipment);
    println!("   区域:   {}", config.sector);
    if !config.tag.is_empty() {
        println!("   标签:   {}", config.tag);
    }
    if !config.lubricant.is_empty() {
        println!("   润滑剂: {}", config.lubricant);
    }
    println!("   给油量: {}", config.volume);
    match config.config_type {
        ConfigType::Basic => println!("   间隔:   {} 小时", config.interval),
        ConfigType::Advanced => println!(
            "   间隔:   {} {}",
            config.interval,
            config.interval_type.label()
        ),
    }
}

fn print_known(known: &[KnownDevice]) {
    for k in known {
        let status = if k.online { "🟢" } else { "⚪" };
        let rssi = k.rssi.map(|r| format!(" {} dBm", r)).unwrap_or_default();
        println!(
            "   {} {} [{}] {}{}",
            status,
            k.device.title(),
            k.device.mac_display(),
            k.device.identity,
            rssi
        );
    }
}

fn print_new(new: &[DiscoveredDevice]) {
    for (i, dev) in new.iter().enumerate() {
        let rssi = dev.rssi.map(|r| format!(" {} dBm", r)).unwrap_or_default();
        println!(
            "   [{}] {} [{}] {}{}",
            i,
            dev.display_name(),
            mac_display(&dev.identity),
            dev.identity,
            rssi
        );
    }
}

fn print_devices(known: &[KnownDevice], new: &[DiscoveredDevice]) {
    if known.is_empty() && new.is_empty() {
        println!("   未发现设备");
        return;
    }
    if !known.is_empty() {
        println!("已保存设备:");
        print_known(known);
    }
    if !new.is_empty() {
        println!("新设备:");
        print_new(new);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // 守护进程返回的错误以非零状态退出
    if let Err(e) = run(cli.command).await {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let resp = client::send_request(IpcRequest::Status).await?;
            if let IpcResponse::Status {
                state,
                device,
                scanning,
            } = resp
            {
                println!("状态: {}", state);
                if let Some(device) = device {
                    println!("设备: {}", device);
                }
                if scanning {
                    println!("正在扫描");
                }
            }
        }
        Commands::Scan { timeout } => {
            println!("🔍 扫描设备 ({}s)...", timeout);
            let resp = client::send_request(IpcRequest::Scan {
                timeout_secs: timeout,
            })
            .await?;
            if let IpcResponse::Devices { known, new } = resp {
                print_devices(&known, &new);
            }
        }
        Commands::Connect { device } => {
            println!("🔗 连接 {}...", device);
            client::send_request(IpcRequest::Connect { device }).await?;
        }
        Commands::Disconnect => {
            client::send_request(IpcRequest::Disconnect).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { device } => {
                let resp = client::send_request(IpcRequest::GetConfig { device }).await?;
                if let IpcResponse::Config { config } = resp {
                    print_config(&config);
                }
            }
            ConfigAction::Set {
                device,
                details,
                volume,
                interval,
                unit,
            } => {
                let interval_type = unit.unwrap_or_default();
                let config = DeviceConfig {
                    volume,
                    interval,
                    config_type: if interval_type == IntervalType::None {
                        ConfigType::Basic
                    } else {
                        ConfigType::Advanced
                    },
                    interval_type,
                    ..details.into_config()
                };
                println!("📤 发送配置到 {}...", device);
                let resp = client::send_request(IpcRequest::SetConfig { device, config }).await?;
                if let IpcResponse::Saved { device } = resp {
                    println!("✅ 设备已确认并保存: {}", device.title());
                }
            }
        },
        Commands::Logs { device } => {
            let resp = client::send_request(IpcRequest::GetLog { device }).await?;
            if let IpcResponse::Logs { logs } = resp {
                if logs.is_empty() {
                    println!("   暂无记录");
                }
                for log in &logs {
                    println!("   {}", log);
                }
            }
        }
        Commands::Led { device, state } => {
            client::send_request(IpcRequest::Led {
                device,
                on: state == "on",
            })
            .await?;
        }
        Commands::Devices => {
            let resp = client::send_request(IpcRequest::Devices).await?;
            if let IpcResponse::Devices { known, new } = resp {
                print_devices(&known, &new);
            }
        }
        Commands::Save { device, details } => {
            let resp = client::send_request(IpcRequest::Save {
                device,
                details: details.into_config(),
            })
            .await?;
            if let IpcResponse::Saved { device } = resp {
                println!("💾 已保存: {} [{}]", device.title(), device.mac_display());
            }
        }
        Commands::Forget { device } => {
            client::send_request(IpcRequest::Forget { device }).await?;
        }
    }

    Ok(())
}
