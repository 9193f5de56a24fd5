//! IPC Client - 与守护进程通信

use anyhow::{Result, bail};
use lubrisense_core::ipc::{IpcRequest, IpcResponse, socket_path};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("   请确保 lubrisense-daemon 正在运行");
            eprintln!("   运行: cargo xtask dev 或 systemctl --user start lubrisense");
            return Err(anyhow::Error::new(e).context("无法连接到守护进程"));
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送请求
    let json = serde_json::to_string(&request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    // 读取响应
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        anyhow::bail!("守护进程未返回响应");
    }

    let response: IpcResponse = serde_json::from_str(&line)?;
    let response = check(response)?;

    if let IpcResponse::Ok { message } = &response {
        println!("✅ {}", message);
    }

    Ok(response)
}

/// 守护进程返回的错误响应转成 `Err`
fn check(response: IpcResponse) -> Result<IpcResponse> {
    match response {
        IpcResponse::Error { message } => bail!(message),
        other => Ok(other),
    }
}
