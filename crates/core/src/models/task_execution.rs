use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 任务执行状态
///
/// 只能向前流转，终态（SUCCESS/FAILURE/KILLED/TIMEOUT）之后不再变化。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    #[default]
    Submitted,
    Dispatched,
    Running,
    Success,
    Failure,
    Killed,
    Timeout,
}

impl TaskExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Dispatched => 1,
            Self::Running => 2,
            Self::Success | Self::Failure | Self::Killed | Self::Timeout => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// 允许跳过中间状态（例如 DISPATCHED 直接失败），但不允许回退或停留
    pub fn can_transition_to(self, next: TaskExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn transition_to(self, next: TaskExecutionStatus) -> SchedulerResult<TaskExecutionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SchedulerError::IllegalStateTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Dispatched => "DISPATCHED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Killed => "KILLED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务执行上下文
///
/// 由接收分发的Worker独占，Master只持有任务实例ID和目标Worker的引用，
/// 状态变化全部通过消息回传。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskExecutionContext {
    pub task_instance_id: i64,
    pub task_name: String,
    pub task_type: String,
    pub workflow_instance_id: i64,
    pub task_definition_code: i64,
    pub task_definition_version: i32,
    pub project_code: i64,
    pub executor_id: i32,
    pub executor_name: String,
    pub warning_group_id: i32,
    pub worker_group: String,
    pub tenant_code: String,
    pub environment_code: Option<i64>,
    #[serde(default)]
    pub start_params: HashMap<String, String>,
    /// 按任务类型解释的执行参数，例如 shell 的 `command`
    #[serde(default)]
    pub task_params: serde_json::Value,
    /// 执行前需要通过存储能力落地的资源文件
    #[serde(default)]
    pub resource_files: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// 任务工作目录，资源文件落地到这里，由 Worker 接收后填写
    #[serde(default)]
    pub execute_path: Option<String>,
    /// 墙钟预算，超出即判定 TIMEOUT
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub current_state: TaskExecutionStatus,
}

impl TaskExecutionContext {
    pub fn new(
        task_instance_id: i64,
        task_name: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            task_instance_id,
            task_name: task_name.into(),
            task_type: task_type.into(),
            worker_group: "default".to_string(),
            tenant_code: "default".to_string(),
            ..Default::default()
        }
    }

    pub fn needs_resources(&self) -> bool {
        !self.resource_files.is_empty()
    }

    /// 启动参数与执行参数中的字符串值，供执行器做变量替换
    pub fn param(&self, key: &str) -> Option<String> {
        self.start_params.get(key).cloned().or_else(|| {
            self.task_params
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
    }
}

/// 任务执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskResult {
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
