use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use tracing::{error, info, warn};

use scheduler_core::{
    SchedulerError, SchedulerResult, TaskExecutionContext, TaskExecutionStatus, WorkerConfig,
};
use scheduler_remote::command::{TaskExecuteStartedMessage, TaskKillResponseMessage};
use scheduler_remote::{HandlerRegistry, MessageChannel};

use crate::executor_factory::{ExecutorRegistry, TaskKind, WorkerTaskExecutorFactory};
use crate::executors::InterruptReason;
use crate::handlers::worker_handlers;
use crate::lifecycle::TaskExecutionHandle;
use crate::message_sender::WorkerMessageSender;
use crate::registry_client::WorkerRegistryClient;
use crate::storage::StorageOperator;

/// 超过该数量时清理已结束任务的记录
const MAX_RETAINED_TASKS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    /// 同一任务实例已经分发过，只补发了最近的状态
    Duplicate(TaskExecutionStatus),
}

enum Admission {
    Accepted(Box<crate::lifecycle::WorkerTaskExecutor>, TaskExecuteStartedMessage),
    Duplicate(TaskExecutionStatus),
    Rejected(TaskExecutionContext, String),
}

/// Worker 上所有任务的入口：接收、去重、拒绝和终止
pub struct TaskExecutionManager {
    worker_config: Arc<WorkerConfig>,
    message_sender: Arc<WorkerMessageSender>,
    storage: Option<Arc<dyn StorageOperator>>,
    registry_client: Arc<dyn WorkerRegistryClient>,
    executors: Arc<ExecutorRegistry>,
    tasks: RwLock<HashMap<i64, TaskExecutionHandle>>,
}

impl TaskExecutionManager {
    pub fn new(
        worker_config: Arc<WorkerConfig>,
        message_sender: Arc<WorkerMessageSender>,
        storage: Option<Arc<dyn StorageOperator>>,
        registry_client: Arc<dyn WorkerRegistryClient>,
        executors: Arc<ExecutorRegistry>,
    ) -> Self {
        Self {
            worker_config,
            message_sender,
            storage,
            registry_client,
            executors,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// 构造管理器，同时把分派到它的消息处理器交给 `connect` 建立通道
    pub fn with_channel<F>(
        worker_config: Arc<WorkerConfig>,
        storage: Option<Arc<dyn StorageOperator>>,
        registry_client: Arc<dyn WorkerRegistryClient>,
        executors: Arc<ExecutorRegistry>,
        connect: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Arc<HandlerRegistry>) -> Arc<dyn MessageChannel>,
    {
        Arc::new_cyclic(|manager| {
            let channel = connect(Arc::new(worker_handlers(manager.clone())));
            let message_sender = Arc::new(WorkerMessageSender::new(channel, &worker_config));
            Self::new(
                worker_config,
                message_sender,
                storage,
                registry_client,
                executors,
            )
        })
    }

    pub fn message_sender(&self) -> &Arc<WorkerMessageSender> {
        &self.message_sender
    }

    pub fn registry_client(&self) -> &Arc<dyn WorkerRegistryClient> {
        &self.registry_client
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn status(&self, task_instance_id: i64) -> Option<TaskExecutionStatus> {
        self.handle(task_instance_id).map(|handle| handle.status())
    }

    pub fn handle(&self, task_instance_id: i64) -> Option<TaskExecutionHandle> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&task_instance_id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|handle| !handle.status().is_terminal())
            .count()
    }

    /// 接收一次分发
    ///
    /// 接受后先在 DISPATCHED 状态下送出 STARTED 再开始执行。
    /// 同一任务实例重复分发时不会再次执行；校验不通过时发送 REJECT 并返回 `TaskRejected`。
    pub async fn accept(&self, context: TaskExecutionContext) -> SchedulerResult<AcceptOutcome> {
        let task_instance_id = context.task_instance_id;

        match self.admit(context) {
            Admission::Duplicate(status) => {
                info!("任务 {} 重复分发，当前状态 {}", task_instance_id, status);
                counter!("worker_duplicate_dispatches_total").increment(1);
                if let Err(e) = self.message_sender.resend_last_status(task_instance_id).await {
                    warn!("补发任务 {} 的状态失败: {}", task_instance_id, e);
                }
                Ok(AcceptOutcome::Duplicate(status))
            }
            Admission::Rejected(context, reason) => {
                warn!("拒绝任务 {}: {}", task_instance_id, reason);
                counter!("worker_tasks_rejected_total").increment(1);
                if let Err(e) = self.message_sender.send_reject(&context, &reason).await {
                    error!("任务 {} 的拒绝消息未送达: {}", task_instance_id, e);
                }
                Err(SchedulerError::rejected(task_instance_id, reason))
            }
            Admission::Accepted(executor, started) => {
                info!(
                    "接收任务 {} ({}), 执行器 {}",
                    task_instance_id,
                    executor.context().task_name,
                    executor.executor_name()
                );
                counter!("worker_tasks_accepted_total").increment(1);
                if let Err(e) = self.message_sender.deliver_started(&started).await {
                    error!("任务 {} 的开始消息未送达: {}", task_instance_id, e);
                }
                tokio::spawn(executor.run());
                Ok(AcceptOutcome::Accepted)
            }
        }
    }

    /// 去重、校验并登记，整个过程持有写锁
    fn admit(&self, context: TaskExecutionContext) -> Admission {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());

        if let Some(handle) = tasks.get(&context.task_instance_id) {
            return Admission::Duplicate(handle.status());
        }

        if let Err(reason) = self.validate(&context) {
            return Admission::Rejected(context, reason);
        }

        if self.registry_client.running_tasks() >= self.worker_config.max_concurrent_tasks {
            let reason = format!(
                "Worker已达到最大并发数 {}",
                self.worker_config.max_concurrent_tasks
            );
            return Admission::Rejected(context, reason);
        }

        let rejected_context = context.clone();
        let factory = WorkerTaskExecutorFactory::new(
            context,
            self.worker_config.clone(),
            self.message_sender.clone(),
            self.storage.clone(),
            self.registry_client.clone(),
        )
        .with_executors(self.executors.clone());
        let executor = match factory.create_worker_task_executor() {
            Ok(executor) => executor,
            Err(e) => return Admission::Rejected(rejected_context, e.to_string()),
        };

        if tasks.len() >= MAX_RETAINED_TASKS {
            tasks.retain(|task_instance_id, handle| {
                let finished = handle.status().is_terminal();
                if finished {
                    self.message_sender.forget(*task_instance_id);
                }
                !finished
            });
        }
        let handle = executor.handle();
        let started = self.message_sender.record_started(executor.context());
        self.registry_client.task_started(handle.task_instance_id());
        tasks.insert(handle.task_instance_id(), handle);
        Admission::Accepted(Box::new(executor), started)
    }

    fn validate(&self, context: &TaskExecutionContext) -> Result<(), String> {
        if context.task_type.trim().is_empty() {
            return Err("任务类型为空".to_string());
        }
        if context.task_name.trim().is_empty() {
            return Err("任务名称为空".to_string());
        }
        if context.task_definition_code <= 0 {
            return Err(format!("无效的任务定义编码: {}", context.task_definition_code));
        }
        if !self.registry_client.serves_group(&context.worker_group) {
            return Err(format!("Worker不服务于分组 {}", context.worker_group));
        }
        if context.needs_resources() && self.storage.is_none() {
            return Err("任务需要资源文件，但Worker未配置存储".to_string());
        }
        let kind = TaskKind::from_task_type(&context.task_type);
        if self.executors.resolve(&kind).is_none() {
            return Err(format!("不支持的任务类型: {}", context.task_type));
        }
        Ok(())
    }

    /// 终止任务；已结束或不存在的任务直接回应，不做任何操作
    pub async fn kill(&self, task_instance_id: i64) -> TaskKillResponseMessage {
        let Some(handle) = self.handle(task_instance_id) else {
            return TaskKillResponseMessage {
                task_instance_id,
                killed: false,
                status: None,
                message: Some("任务不在本Worker上".to_string()),
            };
        };

        let status = handle.status();
        if status.is_terminal() {
            return TaskKillResponseMessage {
                task_instance_id,
                killed: false,
                status: Some(status),
                message: Some(format!("任务已结束: {status}")),
            };
        }

        info!("终止任务 {}", task_instance_id);
        handle.interrupt(InterruptReason::Killed);

        let wait = self.worker_config.kill_grace_period() * 2 + Duration::from_secs(1);
        match tokio::time::timeout(wait, handle.wait_terminal()).await {
            Ok(status) => TaskKillResponseMessage {
                task_instance_id,
                killed: status == TaskExecutionStatus::Killed,
                status: Some(status),
                message: None,
            },
            Err(_) => TaskKillResponseMessage {
                task_instance_id,
                killed: false,
                status: Some(handle.status()),
                message: Some("等待任务结束超时".to_string()),
            },
        }
    }

    /// 停机时终止所有未结束的任务
    pub async fn shutdown(&self) {
        let active: Vec<TaskExecutionHandle> = self
            .tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|handle| !handle.status().is_terminal())
            .cloned()
            .collect();
        if active.is_empty() {
            return;
        }

        info!("停机，终止 {} 个运行中的任务", active.len());
        for handle in &active {
            handle.interrupt(InterruptReason::Killed);
        }
        let wait = self.worker_config.kill_grace_period() * 2 + Duration::from_secs(1);
        for handle in active {
            if tokio::time::timeout(wait, handle.wait_terminal()).await.is_err() {
                warn!("任务 {} 未能在停机前结束", handle.task_instance_id());
            }
        }
    }
}
