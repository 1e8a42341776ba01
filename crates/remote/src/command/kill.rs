use serde::{Deserialize, Serialize};

use scheduler_core::TaskExecutionStatus;

use super::MessageBody;
use crate::message::MessageType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskKillMessage {
    pub task_instance_id: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl MessageBody for TaskKillMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskKill;
}

/// 终止请求的应答
///
/// 对已结束或未知的任务，`killed` 为 false，`status` 给出 Worker 侧已知的最后状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskKillResponseMessage {
    pub task_instance_id: i64,
    pub killed: bool,
    pub status: Option<TaskExecutionStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

impl MessageBody for TaskKillResponseMessage {
    const MESSAGE_TYPE: MessageType = MessageType::TaskKillResponse;
}
