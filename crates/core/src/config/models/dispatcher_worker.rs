use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 停机或时钟跳变后错过触发时间的补偿策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// 按顺序补发所有错过的触发（受 `max_catch_up_fires` 限制）
    #[default]
    FireAll,
    /// 只补发最近一次错过的触发
    FireLatest,
    /// 不补发，直接等待下一个未来的触发时间
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// Master 监听 Worker 连接的地址
    pub listen_address: String,
    pub schedule_interval_seconds: u64,
    pub misfire_policy: MisfirePolicy,
    /// 早于 `now - misfire_threshold_seconds` 的触发时间视为错过
    pub misfire_threshold_seconds: u64,
    pub max_catch_up_fires: usize,
    pub trigger_retry_attempts: u32,
    pub trigger_retry_delay_ms: u64,
    /// 运行中任务超过该时长没有上报即视为可疑
    pub task_report_timeout_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "0.0.0.0:5678".to_string(),
            schedule_interval_seconds: 1,
            misfire_policy: MisfirePolicy::FireAll,
            misfire_threshold_seconds: 60,
            max_catch_up_fires: 100,
            trigger_retry_attempts: 3,
            trigger_retry_delay_ms: 500,
            task_report_timeout_seconds: 180,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_address.is_empty() {
            return Err(anyhow::anyhow!("Master监听地址不能为空"));
        }

        if self.schedule_interval_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.max_catch_up_fires == 0 {
            return Err(anyhow::anyhow!("最大补偿触发次数必须大于0"));
        }

        if self.trigger_retry_attempts == 0 {
            return Err(anyhow::anyhow!("触发重试次数必须至少为1"));
        }

        if self.task_report_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务上报超时时间必须大于0"));
        }

        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_seconds)
    }

    pub fn misfire_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.misfire_threshold_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub hostname: String,
    /// Worker 对外的地址，作为消息的 sender_address
    pub advertise_address: String,
    pub master_address: String,
    pub worker_groups: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub heartbeat_interval_seconds: u64,
    pub task_running_report_interval_seconds: u64,
    pub message_retry_attempts: u32,
    pub message_retry_base_delay_ms: u64,
    pub message_reply_timeout_ms: u64,
    /// 中断信号发出后等待执行器释放资源的时长
    pub kill_grace_period_seconds: u64,
    pub storage_base_dir: Option<String>,
    pub task_work_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_id: "worker-001".to_string(),
            hostname: "localhost".to_string(),
            advertise_address: "127.0.0.1:1234".to_string(),
            master_address: "127.0.0.1:5678".to_string(),
            worker_groups: vec!["default".to_string()],
            max_concurrent_tasks: 16,
            heartbeat_interval_seconds: 10,
            task_running_report_interval_seconds: 5,
            message_retry_attempts: 5,
            message_retry_base_delay_ms: 200,
            message_reply_timeout_ms: 3000,
            kill_grace_period_seconds: 10,
            storage_base_dir: None,
            task_work_dir: "/tmp/scheduler/exec".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.hostname.is_empty() {
            return Err(anyhow::anyhow!("主机名不能为空"));
        }

        if self.master_address.is_empty() {
            return Err(anyhow::anyhow!("Master地址不能为空"));
        }

        if self.worker_groups.is_empty() {
            return Err(anyhow::anyhow!("Worker分组不能为空"));
        }

        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.task_running_report_interval_seconds == 0 {
            return Err(anyhow::anyhow!("任务运行上报间隔必须大于0"));
        }

        if self.message_retry_attempts == 0 {
            return Err(anyhow::anyhow!("消息重试次数必须至少为1"));
        }

        if self.message_reply_timeout_ms == 0 {
            return Err(anyhow::anyhow!("消息应答超时必须大于0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn running_report_interval(&self) -> Duration {
        Duration::from_secs(self.task_running_report_interval_seconds)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.message_reply_timeout_ms)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_seconds)
    }

    pub fn serves_group(&self, worker_group: &str) -> bool {
        self.worker_groups.iter().any(|g| g == worker_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_worker_config_rejects_empty_groups() {
        let config = WorkerConfig {
            worker_groups: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatcher_config_rejects_zero_interval() {
        let config = DispatcherConfig {
            schedule_interval_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_misfire_policy_names() {
        let policy: MisfirePolicy = serde_json::from_str("\"fire_latest\"").unwrap();
        assert_eq!(policy, MisfirePolicy::FireLatest);
    }

    #[test]
    fn test_serves_group() {
        let config = WorkerConfig::default();
        assert!(config.serves_group("default"));
        assert!(!config.serves_group("gpu"));
    }
}
