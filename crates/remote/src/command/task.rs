use serde::{Deserialize, Serialize};

use scheduler_core::{TaskExecutionContext, TaskExecutionStatus};

use super::MessageBody;
use crate::message::MessageType;

/// Master → Worker：分发一个任务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteStartMessage {
    pub task_execution_context: TaskExecutionContext,
}

impl MessageBody for TaskExecuteStartMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskExecuteStart;
}

/// Worker → Master：任务已被接受并开始执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteStartedMessage {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub host: String,
    pub start_time_millis: i64,
    pub status: TaskExecutionStatus,
}

impl MessageBody for TaskExecuteStartedMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskExecuteStarted;
}

/// Worker → Master：运行中心跳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteRunningMessage {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub host: String,
    pub report_time_millis: i64,
}

impl MessageBody for TaskExecuteRunningMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskExecuteRunning;
}

/// Worker → Master：终态上报，每个任务实例恰好一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteFinishMessage {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub host: String,
    pub status: TaskExecutionStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub end_time_millis: i64,
    pub execution_time_ms: u64,
}

impl MessageBody for TaskExecuteFinishMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskExecuteFinish;
}

/// 对分发与生命周期上报的确认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventAckMessage {
    pub task_instance_id: i64,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskEventAckMessage {
    pub fn ok(task_instance_id: i64) -> Self {
        Self {
            task_instance_id,
            success: true,
            message: None,
        }
    }

    pub fn failed(task_instance_id: i64, message: impl Into<String>) -> Self {
        Self {
            task_instance_id,
            success: false,
            message: Some(message.into()),
        }
    }
}

impl MessageBody for TaskEventAckMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskEventAck;
}

/// Worker → Master：拒绝执行分发来的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRejectMessage {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub host: String,
    pub reason: String,
}

impl MessageBody for TaskRejectMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskReject;
}
