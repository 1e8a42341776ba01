//! Master 侧的任务状态跟踪与生命周期消息处理

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use scheduler_core::{SchedulerResult, TaskExecutionContext, TaskExecutionStatus};
use scheduler_remote::command::{
    HeartBeatMessage, TaskEventAckMessage, TaskExecuteFinishMessage, TaskExecuteRunningMessage,
    TaskExecuteStartedMessage, TaskRejectMessage,
};
use scheduler_remote::{ChannelDirectory, Message, MessageBody, MessageHandler, MessageType, RemoteChannel};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTask {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_name: String,
    pub worker_address: String,
    pub status: TaskExecutionStatus,
    pub last_report_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// 任务状态只向前推进，迟到或重复的上报被忽略
#[derive(Debug, Default)]
pub struct TaskEventTracker {
    tasks: RwLock<HashMap<i64, TrackedTask>>,
}

impl TaskEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(
        &self,
        context: &TaskExecutionContext,
        worker_address: &str,
        now: DateTime<Utc>,
    ) {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks
            .entry(context.task_instance_id)
            .or_insert_with(|| TrackedTask {
                task_instance_id: context.task_instance_id,
                workflow_instance_id: context.workflow_instance_id,
                task_name: context.task_name.clone(),
                worker_address: worker_address.to_string(),
                status: TaskExecutionStatus::Dispatched,
                last_report_time: now,
                exit_code: None,
                error_message: None,
            });
    }

    pub fn remove(&self, task_instance_id: i64) -> Option<TrackedTask> {
        self.tasks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_instance_id)
    }

    /// 仍停留在 DISPATCHED 时撤销跟踪，返回是否撤销
    pub fn discard_unconfirmed(&self, task_instance_id: i64) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        match tasks.get(&task_instance_id) {
            Some(task) if task.status == TaskExecutionStatus::Dispatched => {
                tasks.remove(&task_instance_id);
                true
            }
            _ => false,
        }
    }

    /// 应用一次状态上报，状态确实前进时返回 true
    pub fn apply(
        &self,
        task_instance_id: i64,
        status: TaskExecutionStatus,
        now: DateTime<Utc>,
    ) -> bool {
        self.update(task_instance_id, status, now, |_| {})
    }

    fn update(
        &self,
        task_instance_id: i64,
        status: TaskExecutionStatus,
        now: DateTime<Utc>,
        fill: impl FnOnce(&mut TrackedTask),
    ) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        let Some(task) = tasks.get_mut(&task_instance_id) else {
            debug!("忽略未跟踪任务 {} 的上报: {}", task_instance_id, status);
            return false;
        };

        match task.status.transition_to(status) {
            Ok(next) => {
                task.status = next;
                task.last_report_time = now;
                fill(task);
                true
            }
            Err(_) => {
                if task.status == status && !status.is_terminal() {
                    task.last_report_time = now;
                } else {
                    debug!(
                        "忽略任务 {} 的过期上报: {} -> {}",
                        task_instance_id, task.status, status
                    );
                }
                false
            }
        }
    }

    /// 运行中心跳只刷新上报时间
    pub fn touch(&self, task_instance_id: i64, now: DateTime<Utc>) {
        if !self.apply(task_instance_id, TaskExecutionStatus::Running, now) {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            if let Some(task) = tasks.get_mut(&task_instance_id) {
                if !task.status.is_terminal() {
                    task.last_report_time = now;
                }
            }
        }
    }

    pub fn get(&self, task_instance_id: i64) -> Option<TrackedTask> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&task_instance_id)
            .cloned()
    }

    /// 长时间没有上报的活跃任务
    pub fn stale_tasks(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<TrackedTask> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|t| t.status.is_active() && now - t.last_report_time > timeout)
            .cloned()
            .collect()
    }

    pub fn tasks_on_worker(&self, worker_address: &str) -> Vec<TrackedTask> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|t| t.worker_address == worker_address)
            .cloned()
            .collect()
    }
}

/// 处理 Worker 上报的 STARTED / RUNNING / FINISH / REJECT
///
/// 处理是幂等的：重复上报同样回确认，Worker 重试时不会造成重复的状态变化。
pub struct TaskEventHandler {
    tracker: Arc<TaskEventTracker>,
}

impl TaskEventHandler {
    pub fn new(tracker: Arc<TaskEventTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl MessageHandler for TaskEventHandler {
    async fn handle(
        &self,
        message: Message,
        _channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        let now = Utc::now();
        match message.message_type {
            MessageType::TaskExecuteStarted => {
                let started: TaskExecuteStartedMessage = message.body_as()?;
                // Worker 接收时上报 DISPATCHED，进入执行后以 RUNNING 心跳推进
                if self
                    .tracker
                    .apply(started.task_instance_id, started.status, now)
                {
                    info!(
                        "任务 {} 在 {} 上进入 {}",
                        started.task_instance_id, started.host, started.status
                    );
                } else {
                    debug!("任务 {} 已被 {} 接收", started.task_instance_id, started.host);
                }
                let ack = TaskEventAckMessage::ok(started.task_instance_id);
                Ok(Some(ack.to_reply(&message)?))
            }
            MessageType::TaskExecuteRunning => {
                let running: TaskExecuteRunningMessage = message.body_as()?;
                self.tracker.touch(running.task_instance_id, now);
                Ok(None)
            }
            MessageType::TaskExecuteFinish => {
                let finish: TaskExecuteFinishMessage = message.body_as()?;
                let advanced = self.tracker.update(
                    finish.task_instance_id,
                    finish.status,
                    now,
                    |task| {
                        task.exit_code = finish.exit_code;
                        task.error_message = finish.error_message.clone();
                    },
                );
                if advanced {
                    counter!("task_finished_total", "status" => finish.status.as_str())
                        .increment(1);
                    info!(
                        "任务 {} 结束: {} (耗时 {}ms)",
                        finish.task_instance_id, finish.status, finish.execution_time_ms
                    );
                }
                let ack = TaskEventAckMessage::ok(finish.task_instance_id);
                Ok(Some(ack.to_reply(&message)?))
            }
            MessageType::TaskReject => {
                let reject: TaskRejectMessage = message.body_as()?;
                let reason = reject.reason.clone();
                if self.tracker.update(
                    reject.task_instance_id,
                    TaskExecutionStatus::Failure,
                    now,
                    |task| task.error_message = Some(format!("被Worker拒绝: {reason}")),
                ) {
                    counter!("task_rejected_total").increment(1);
                }
                warn!(
                    "任务 {} 被 {} 拒绝: {}",
                    reject.task_instance_id, reject.host, reject.reason
                );
                let ack = TaskEventAckMessage::ok(reject.task_instance_id);
                Ok(Some(ack.to_reply(&message)?))
            }
            other => {
                warn!("TaskEventHandler 收到不支持的消息类型: {}", other);
                Ok(None)
            }
        }
    }
}

/// 记录 Worker 心跳，并按公布地址登记通道供推送使用
pub struct HeartBeatHandler {
    directory: ChannelDirectory,
    workers: RwLock<HashMap<String, HeartBeatMessage>>,
}

impl HeartBeatHandler {
    pub fn new(directory: ChannelDirectory) -> Self {
        Self {
            directory,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn last_heartbeat(&self, worker_address: &str) -> Option<HeartBeatMessage> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(worker_address)
            .cloned()
    }

    /// 服务于指定分组且负载最低的 Worker
    pub fn select_worker(&self, worker_group: &str) -> Option<String> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|hb| hb.worker_groups.iter().any(|g| g == worker_group))
            .filter(|hb| hb.running_tasks < hb.max_concurrent_tasks)
            .filter(|hb| self.directory.get(&hb.worker_address).is_some())
            .min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))
            .map(|hb| hb.worker_address.clone())
    }
}

#[async_trait]
impl MessageHandler for HeartBeatHandler {
    async fn handle(
        &self,
        message: Message,
        channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        let heartbeat: HeartBeatMessage = message.body_as()?;
        debug!(
            "收到 Worker {} 心跳: 运行中 {}/{}",
            heartbeat.worker_id, heartbeat.running_tasks, heartbeat.max_concurrent_tasks
        );

        self.directory
            .register(heartbeat.worker_address.clone(), channel.clone());
        self.workers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(heartbeat.worker_address.clone(), heartbeat);
        Ok(None)
    }
}
