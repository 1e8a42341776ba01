use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Master与Worker之间的传输层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub max_frame_size_bytes: usize,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// 入站去重窗口大小（最近的 sender+opaque 数量）
    pub dedup_window_size: usize,
    pub outbound_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: 16 * 1024 * 1024,
            connect_timeout_ms: 5000,
            reconnect_base_delay_ms: 200,
            reconnect_max_delay_ms: 10_000,
            reconnect_max_attempts: 10,
            dedup_window_size: 1024,
            outbound_buffer_size: 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size_bytes < 64 {
            return Err(anyhow::anyhow!("最大帧长度过小: {}", self.max_frame_size_bytes));
        }

        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(anyhow::anyhow!("重连基础间隔不能大于最大间隔"));
        }

        if self.outbound_buffer_size == 0 {
            return Err(anyhow::anyhow!("发送缓冲区大小必须大于0"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
