use std::time::Duration;
use uuid::Uuid;

/// BLE 会话错误
///
/// 会话层对外只暴露 `bool` / `Option`，这些错误在边界处被记录后丢弃。
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Session is not ready")]
    NotReady,

    #[error("Characteristic does not support writes")]
    NotWritable,

    #[error("Write failed at chunk {chunk}: {reason}")]
    WriteFailed { chunk: usize, reason: String },

    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

impl BleError {
    /// 连接类失败可以整体重试；取消和缺少适配器不行
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BleError::DeviceNotFound(_)
                | BleError::ConnectTimeout(_)
                | BleError::ConnectionFailed(_)
                | BleError::CharacteristicNotFound { .. }
                | BleError::SubscribeFailed(_)
                | BleError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BleError::DeviceNotFound("x".into()).is_retryable());
        assert!(BleError::ConnectTimeout(Duration::from_secs(10)).is_retryable());
        assert!(
            BleError::CharacteristicNotFound {
                service: Uuid::nil(),
                characteristic: Uuid::nil(),
            }
            .is_retryable()
        );
        assert!(!BleError::NoAdapter.is_retryable());
        assert!(!BleError::Cancelled.is_retryable());
        assert!(!BleError::NotReady.is_retryable());
    }
}
