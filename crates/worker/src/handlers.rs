//! Worker 处理的 Master 指令

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_remote::command::{
    TaskEventAckMessage, TaskExecuteStartMessage, TaskKillMessage, TaskKillResponseMessage,
};
use scheduler_remote::{
    HandlerRegistry, Message, MessageBody, MessageHandler, MessageType, PingHandler, RemoteChannel,
};

use crate::execution_manager::TaskExecutionManager;

/// Worker 连接上注册的全部处理器
pub fn worker_handlers(manager: Weak<TaskExecutionManager>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            MessageType::TaskExecuteStart,
            Arc::new(TaskExecuteStartHandler::new(manager.clone())),
        )
        .with(MessageType::TaskKill, Arc::new(TaskKillHandler::new(manager)))
        .with(MessageType::Ping, Arc::new(PingHandler))
}

/// 处理任务分发，以 ACK 告知是否接收
pub struct TaskExecuteStartHandler {
    manager: Weak<TaskExecutionManager>,
}

impl TaskExecuteStartHandler {
    pub fn new(manager: Weak<TaskExecutionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageHandler for TaskExecuteStartHandler {
    async fn handle(
        &self,
        message: Message,
        _channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        let start: TaskExecuteStartMessage = message.body_as()?;
        let task_instance_id = start.task_execution_context.task_instance_id;

        let Some(manager) = self.manager.upgrade() else {
            warn!("Worker 正在停止，拒绝任务 {}", task_instance_id);
            let ack = TaskEventAckMessage::failed(task_instance_id, "Worker正在停止");
            return Ok(Some(ack.to_reply(&message)?));
        };

        let ack = match manager.accept(start.task_execution_context).await {
            Ok(_) => TaskEventAckMessage::ok(task_instance_id),
            Err(SchedulerError::TaskRejected { reason, .. }) => {
                TaskEventAckMessage::failed(task_instance_id, reason)
            }
            Err(e) => TaskEventAckMessage::failed(task_instance_id, e.to_string()),
        };
        Ok(Some(ack.to_reply(&message)?))
    }
}

pub struct TaskKillHandler {
    manager: Weak<TaskExecutionManager>,
}

impl TaskKillHandler {
    pub fn new(manager: Weak<TaskExecutionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageHandler for TaskKillHandler {
    async fn handle(
        &self,
        message: Message,
        _channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        let kill: TaskKillMessage = message.body_as()?;
        if let Some(reason) = &kill.reason {
            info!("收到任务 {} 的终止请求: {}", kill.task_instance_id, reason);
        }

        let response = match self.manager.upgrade() {
            Some(manager) => manager.kill(kill.task_instance_id).await,
            None => TaskKillResponseMessage {
                task_instance_id: kill.task_instance_id,
                killed: false,
                status: None,
                message: Some("Worker正在停止".to_string()),
            },
        };
        Ok(Some(response.to_reply(&message)?))
    }
}
