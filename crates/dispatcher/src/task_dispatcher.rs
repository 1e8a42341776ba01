use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TaskExecutionContext};
use scheduler_remote::command::{
    TaskEventAckMessage, TaskExecuteStartMessage, TaskKillMessage, TaskKillResponseMessage,
};
use scheduler_remote::{ChannelDirectory, MessageBody, MessageChannel, MessageContext};

use crate::task_event::TaskEventTracker;

/// 向 Worker 推送任务分发与终止请求
pub struct TaskDispatcher {
    local_address: String,
    directory: ChannelDirectory,
    tracker: Arc<TaskEventTracker>,
    reply_timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(
        local_address: impl Into<String>,
        directory: ChannelDirectory,
        tracker: Arc<TaskEventTracker>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            directory,
            tracker,
            reply_timeout,
        }
    }

    fn channel(&self, worker_address: &str) -> SchedulerResult<Arc<dyn MessageChannel>> {
        self.directory
            .get(worker_address)
            .map(|channel| Arc::new(channel) as Arc<dyn MessageChannel>)
            .ok_or_else(|| {
                SchedulerError::ConnectionLost(format!("没有到 Worker {worker_address} 的可用连接"))
            })
    }

    /// 分发任务
    ///
    /// 发送前先登记为 DISPATCHED，Worker 在确认前上报的 STARTED / FINISH 不会丢失；
    /// 被拒绝或发送失败时撤销登记。
    pub async fn dispatch(
        &self,
        context: TaskExecutionContext,
        worker_address: &str,
    ) -> SchedulerResult<()> {
        let channel = self.channel(worker_address)?;
        let task_instance_id = context.task_instance_id;

        let request = TaskExecuteStartMessage {
            task_execution_context: context.clone(),
        }
        .to_request(MessageContext::new(self.local_address.clone(), worker_address))?;

        self.tracker
            .record_dispatched(&context, worker_address, Utc::now());

        let ack = match channel
            .send_and_await_reply(request, self.reply_timeout)
            .await
            .and_then(|reply| reply.body_as::<TaskEventAckMessage>())
        {
            Ok(ack) => ack,
            Err(e) => {
                // 没有任何上报时才撤销，Worker 可能已经收到
                if self.tracker.discard_unconfirmed(task_instance_id) {
                    warn!("任务 {} 分发到 {} 失败: {}", task_instance_id, worker_address, e);
                }
                return Err(e);
            }
        };

        if !ack.success {
            let reason = ack.message.unwrap_or_else(|| "未说明原因".to_string());
            warn!("任务 {} 被 {} 拒绝: {}", task_instance_id, worker_address, reason);
            self.tracker.remove(task_instance_id);
            return Err(SchedulerError::rejected(task_instance_id, reason));
        }

        info!("任务 {} 已分发到 {}", task_instance_id, worker_address);
        Ok(())
    }

    /// 请求终止任务；任务已结束时 Worker 同样会应答
    pub async fn kill(
        &self,
        task_instance_id: i64,
        reason: Option<String>,
    ) -> SchedulerResult<TaskKillResponseMessage> {
        let task = self
            .tracker
            .get(task_instance_id)
            .ok_or(SchedulerError::TaskNotFound {
                id: task_instance_id,
            })?;
        let channel = self.channel(&task.worker_address)?;

        let request = TaskKillMessage {
            task_instance_id,
            reason,
        }
        .to_request(MessageContext::new(
            self.local_address.clone(),
            task.worker_address.clone(),
        ))?;

        let reply = channel
            .send_and_await_reply(request, self.reply_timeout)
            .await?;
        let response: TaskKillResponseMessage = reply.body_as()?;
        info!(
            "任务 {} 终止请求完成: killed={}, status={:?}",
            task_instance_id, response.killed, response.status
        );
        Ok(response)
    }
}
