//! 声明式重试策略
//!
//! 连接状态机在每次失败后询问策略：还能不能重试，等多久。

use crate::ble::BleError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 每次等待相同时间
    Fixed(Duration),
    /// 第 n 次失败后等待 n × base
    Linear(Duration),
    /// 第 n 次失败后等待 base × 2^(n-1)
    Exponential(Duration),
}

impl Backoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(base) => base.saturating_mul(n),
            Backoff::Exponential(base) => base.saturating_mul(1u32 << (n - 1).min(16)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 包含首次尝试在内的总次数
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub max_delay: Duration,
    /// 在计算出的等待时间上随机增加至多 25%
    pub jitter: bool,
    pub retryable: fn(&BleError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear(Duration::from_secs(1)),
            max_delay: Duration::from_secs(10),
            jitter: false,
            retryable: BleError::is_retryable,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Default::default()
        }
    }

    /// 只尝试一次
    pub fn never() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_predicate(mut self, retryable: fn(&BleError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// 第 `attempt` 次尝试（从 1 开始）以 `error` 失败后，下一次前的等待时间
    ///
    /// 返回 `None` 表示放弃：次数用尽或错误不可重试。
    pub fn next_delay(&self, attempt: u32, error: &BleError) -> Option<Duration> {
        if attempt >= self.max_attempts || !(self.retryable)(error) {
            return None;
        }

        let mut delay = self.backoff.delay_for(attempt).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..0.25);
            delay = delay.mul_f64(1.0 + extra).min(self.max_delay);
        }
        Some(delay)
    }
}
