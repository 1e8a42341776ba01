use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, error, warn};

use scheduler_core::{
    SchedulerError, SchedulerResult, TaskExecutionContext, TaskExecutionStatus, TaskResult,
    WorkerConfig,
};
use scheduler_remote::command::{
    HeartBeatMessage, TaskEventAckMessage, TaskExecuteFinishMessage, TaskExecuteRunningMessage,
    TaskExecuteStartedMessage, TaskRejectMessage,
};
use scheduler_remote::{MessageBody, MessageChannel, MessageContext, RetryPolicy};

/// 最近一次发出的状态消息，重复分发时原样补发
#[derive(Debug, Clone)]
enum LastStatus {
    Started(TaskExecuteStartedMessage),
    Finish(TaskExecuteFinishMessage),
}

/// Worker 向 Master 发送任务事件
///
/// STARTED / FINISH / REJECT 需要 Master 确认，失败时换新的 opaque 重试；
/// RUNNING 和心跳只管发出。重试用尽只记录错误，不回滚本地状态。
pub struct WorkerMessageSender {
    channel: Arc<dyn MessageChannel>,
    host: String,
    retry: RetryPolicy,
    reply_timeout: Duration,
    last_status: RwLock<HashMap<i64, LastStatus>>,
}

impl WorkerMessageSender {
    pub fn new(channel: Arc<dyn MessageChannel>, config: &WorkerConfig) -> Self {
        let base_delay = Duration::from_millis(config.message_retry_base_delay_ms);
        Self {
            channel,
            host: config.advertise_address.clone(),
            retry: RetryPolicy::new(config.message_retry_attempts, base_delay, base_delay * 50),
            reply_timeout: config.reply_timeout(),
            last_status: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn context(&self) -> MessageContext {
        MessageContext::new(self.channel.local_address(), self.channel.remote_address())
    }

    fn remember(&self, task_instance_id: i64, status: LastStatus) {
        self.last_status
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_instance_id, status);
    }

    pub fn forget(&self, task_instance_id: i64) {
        self.last_status
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_instance_id);
    }

    /// 登记接收任务时的 STARTED 消息，投递完成前的重复分发也能补发
    pub fn record_started(&self, context: &TaskExecutionContext) -> TaskExecuteStartedMessage {
        let started = TaskExecuteStartedMessage {
            task_instance_id: context.task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            host: self.host.clone(),
            start_time_millis: Utc::now().timestamp_millis(),
            status: context.current_state,
        };
        self.remember(context.task_instance_id, LastStatus::Started(started.clone()));
        started
    }

    pub async fn deliver_started(&self, started: &TaskExecuteStartedMessage) -> SchedulerResult<()> {
        self.deliver(started.task_instance_id, started).await
    }

    /// 运行中心跳，失败只记录
    pub async fn send_running(&self, context: &TaskExecutionContext) {
        let running = TaskExecuteRunningMessage {
            task_instance_id: context.task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            host: self.host.clone(),
            report_time_millis: Utc::now().timestamp_millis(),
        };
        let result = match running.to_request(self.context()) {
            Ok(message) => self.channel.send(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!("任务 {} 的运行上报发送失败: {}", context.task_instance_id, e);
        }
    }

    pub async fn send_finish(
        &self,
        context: &TaskExecutionContext,
        status: TaskExecutionStatus,
        result: &TaskResult,
    ) -> SchedulerResult<()> {
        let finish = TaskExecuteFinishMessage {
            task_instance_id: context.task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            host: self.host.clone(),
            status,
            exit_code: result.exit_code,
            error_message: result.error_message.clone(),
            end_time_millis: Utc::now().timestamp_millis(),
            execution_time_ms: result.execution_time_ms,
        };
        self.remember(context.task_instance_id, LastStatus::Finish(finish.clone()));
        self.deliver(context.task_instance_id, &finish).await
    }

    pub async fn send_reject(
        &self,
        context: &TaskExecutionContext,
        reason: &str,
    ) -> SchedulerResult<()> {
        let reject = TaskRejectMessage {
            task_instance_id: context.task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            host: self.host.clone(),
            reason: reason.to_string(),
        };
        self.deliver(context.task_instance_id, &reject).await
    }

    /// 补发最近一次状态消息，没有记录时返回 false
    pub async fn resend_last_status(&self, task_instance_id: i64) -> SchedulerResult<bool> {
        let last = self
            .last_status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&task_instance_id)
            .cloned();
        match last {
            Some(LastStatus::Started(started)) => {
                self.deliver(task_instance_id, &started).await?;
                Ok(true)
            }
            Some(LastStatus::Finish(finish)) => {
                self.deliver(task_instance_id, &finish).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn send_heartbeat(&self, heartbeat: &HeartBeatMessage) -> SchedulerResult<()> {
        let message = heartbeat.to_request(self.context())?;
        self.channel.send(message).await
    }

    async fn deliver<T>(&self, task_instance_id: i64, body: &T) -> SchedulerResult<()>
    where
        T: MessageBody + Sync,
    {
        let what = T::MESSAGE_TYPE.to_string();
        let result = self
            .retry
            .run(&what, |attempt| async move {
                if attempt > 1 {
                    debug!("重发任务 {} 的 {} 消息, 第 {} 次", task_instance_id, T::MESSAGE_TYPE, attempt);
                }
                let request = body.to_request(self.context())?;
                let reply = self
                    .channel
                    .send_and_await_reply(request, self.reply_timeout)
                    .await?;
                let ack: TaskEventAckMessage = reply.body_as()?;
                if ack.success {
                    Ok(())
                } else {
                    Err(SchedulerError::Internal(format!(
                        "Master 拒绝确认: {}",
                        ack.message.unwrap_or_default()
                    )))
                }
            })
            .await;

        match &result {
            Err(e @ SchedulerError::DeliveryFailed { .. }) => {
                counter!("worker_message_delivery_failures_total", "type" => what.clone())
                    .increment(1);
                error!("任务 {} 的消息投递失败: {}", task_instance_id, e);
            }
            Err(e) => warn!("任务 {} 的 {} 消息未被确认: {}", task_instance_id, what, e),
            Ok(()) => {}
        }
        result
    }
}
