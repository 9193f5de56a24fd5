//! 分片写入器
//!
//! 未协商 MTU 时 BLE 只保证 20 字节的写入载荷。出站 JSON 被切成固定
//! 大小的块，按顺序写入，块间留出间隔以免冲垮外设缓冲。分片不带头部，
//! 接收端只靠括号计数重组。

use crate::ble::BleError;
use crate::ble::radio::{CharacteristicHandle, Link};
use log::{debug, trace, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: usize = 20;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// 把载荷切成至多 `chunk_size` 字节的块
pub fn chunks(payload: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    payload.chunks(chunk_size.max(1))
}

#[derive(Debug, Clone)]
pub struct ChunkedWriter {
    chunk_size: usize,
    pacing: Duration,
}

impl Default for ChunkedWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_DELAY)
    }
}

impl ChunkedWriter {
    pub fn new(chunk_size: usize, pacing: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 按序写出全部分片，返回写出的块数
    ///
    /// 第一次写失败即中止，剩余分片不再发送；已发出的部分无法撤回，
    /// 是否完整送达需要应用层应答确认。`cancel` 在块与块之间检查。
    pub async fn write(
        &self,
        link: &dyn Link,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<usize, BleError> {
        if !characteristic.properties.supports_write() {
            return Err(BleError::NotWritable);
        }

        let mode = characteristic.preferred_write_mode();
        let total = payload.len().div_ceil(self.chunk_size);
        debug!(
            "Writing {} bytes in {} chunk(s) to {}",
            payload.len(),
            total,
            link.identity()
        );

        for (index, chunk) in chunks(payload, self.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                warn!("Write cancelled after {}/{} chunks", index, total);
                return Err(BleError::Cancelled);
            }

            if let Err(e) = link.write(characteristic, chunk, mode).await {
                warn!("Chunk {}/{} failed: {}", index + 1, total, e);
                return Err(BleError::WriteFailed {
                    chunk: index,
                    reason: e.to_string(),
                });
            }
            trace!("Chunk {}/{} written ({} bytes)", index + 1, total, chunk.len());

            if index + 1 < total && !self.pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("Write cancelled after {}/{} chunks", index + 1, total);
                        return Err(BleError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.pacing) => {}
                }
            }
        }

        Ok(total)
    }
}
