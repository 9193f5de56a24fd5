//! 通知分片重组
//!
//! 固件通过同一特征以任意长度的通知分片推送 JSON，分片本身不携带
//! 任何头部。文档边界只由 `{` / `}` 的平衡计数决定：出现过至少一个
//! `{` 且计数回到零时，一个完整文档结束。
//!
//! 计数在原始字节上进行。`{` 和 `}` 是 ASCII，不会出现在多字节 UTF-8
//! 序列内部，因此被分片切断的字符会在解码前自然拼回。

use log::{debug, warn};
use std::fmt;

/// 默认单个文档的字节上限
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// 一个完整的 JSON 文档
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    text: String,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    depth: usize,
    seen_open: bool,
    max_frame_bytes: usize,
    overflows: u64,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameReassembler {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            seen_open: false,
            max_frame_bytes: max_frame_bytes.max(1),
            overflows: 0,
        }
    }

    /// 追加一个分片，返回本分片内完成的所有文档
    pub fn push(&mut self, fragment: &[u8]) -> Vec<Message> {
        let mut completed = Vec::new();

        for &byte in fragment {
            self.buffer.push(byte);
            match byte {
                b'{' => {
                    self.depth += 1;
                    self.seen_open = true;
                }
                // 尚未出现 `{` 时的 `}` 不计入平衡
                b'}' if self.depth > 0 => self.depth -= 1,
                _ => {}
            }

            if self.seen_open && self.depth == 0 {
                let bytes = std::mem::take(&mut self.buffer);
                self.seen_open = false;
                let text = String::from_utf8_lossy(&bytes).into_owned();
                debug!("Frame complete ({} bytes)", bytes.len());
                completed.push(Message::new(text));
                continue;
            }

            if self.buffer.len() > self.max_frame_bytes {
                warn!(
                    "Frame exceeded {} bytes without balancing, discarding buffer",
                    self.max_frame_bytes
                );
                self.overflows += 1;
                self.reset();
                // 丢弃本分片剩余部分，下一个分片重新开始累积
                break;
            }
        }

        completed
    }

    /// 丢弃未完成的缓冲
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.seen_open = false;
    }

    /// 当前未完成文档的字节数
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }
}
