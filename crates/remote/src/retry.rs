use std::future::Future;
use std::time::Duration;

use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// 第 `retry` 次重试前的等待时间（从0开始）
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64().max(base);

        // 计算指数退避间隔
        let exponential = base * self.backoff_multiplier.powi(retry as i32);
        let capped = exponential.min(max);

        // 添加随机抖动以避免雷群效应
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_secs_f64((capped + jitter).clamp(0.0, max))
    }

    /// 反复执行 `operation`，直到成功、遇到不可重试的错误或次数用尽
    ///
    /// 次数用尽时返回 `DeliveryFailed`，其中带上最后一次的错误。
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> SchedulerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for(attempt - 1)).await;
            }
            match operation(attempt + 1).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("{} 第 {}/{} 次尝试失败: {}", what, attempt + 1, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SchedulerError::DeliveryFailed {
            message_type: what.to_string(),
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "未知错误".to_string()),
        })
    }
}
