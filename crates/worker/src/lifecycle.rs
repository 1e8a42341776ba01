//! 单个任务在 Worker 上的执行生命周期
//!
//! ```text
//! DISPATCHED → RUNNING → SUCCESS | FAILURE | KILLED | TIMEOUT
//! ```
//!
//! 状态只经由 [`TaskExecutionHandle`] 前进，终态之后的任何转换都会被拒绝，
//! 因此每个任务最多发出一条 FINISH 消息。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use scheduler_core::{
    SchedulerError, SchedulerResult, TaskExecutionContext, TaskExecutionStatus, TaskResult,
    WorkerConfig,
};

use crate::executors::{ExecutionOutcome, InterruptReason, InterruptSignal, TaskExecutor};
use crate::message_sender::WorkerMessageSender;
use crate::registry_client::WorkerRegistryClient;
use crate::storage::StorageOperator;

struct HandleInner {
    task_instance_id: i64,
    status: watch::Sender<TaskExecutionStatus>,
    interrupt: watch::Sender<Option<InterruptReason>>,
}

/// 执行中任务的外部句柄：查询状态、发出中断、等待结束
#[derive(Clone)]
pub struct TaskExecutionHandle {
    inner: Arc<HandleInner>,
}

impl TaskExecutionHandle {
    fn new(task_instance_id: i64) -> (Self, InterruptSignal) {
        let (interrupt, signal) = InterruptSignal::channel();
        let (status, _) = watch::channel(TaskExecutionStatus::Dispatched);
        let handle = Self {
            inner: Arc::new(HandleInner {
                task_instance_id,
                status,
                interrupt,
            }),
        };
        (handle, signal)
    }

    pub fn task_instance_id(&self) -> i64 {
        self.inner.task_instance_id
    }

    pub fn status(&self) -> TaskExecutionStatus {
        *self.inner.status.borrow()
    }

    /// 发出中断，只有第一次且任务尚未结束时生效
    pub fn interrupt(&self, reason: InterruptReason) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.inner.interrupt.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        *self.inner.interrupt.borrow()
    }

    pub async fn wait_terminal(&self) -> TaskExecutionStatus {
        let mut receiver = self.inner.status.subscribe();
        let status = match receiver.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    fn transition(&self, next: TaskExecutionStatus) -> SchedulerResult<TaskExecutionStatus> {
        let mut result = Ok(next);
        self.inner.status.send_if_modified(|current| match current.transition_to(next) {
            Ok(next) => {
                *current = next;
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }
}

fn status_for(reason: InterruptReason) -> TaskExecutionStatus {
    match reason {
        InterruptReason::Killed => TaskExecutionStatus::Killed,
        InterruptReason::Timeout => TaskExecutionStatus::Timeout,
    }
}

fn failed_result(error: &SchedulerError) -> TaskResult {
    TaskResult {
        error_message: Some(error.to_string()),
        ..Default::default()
    }
}

fn interrupted_result(reason: InterruptReason) -> TaskResult {
    TaskResult {
        error_message: Some(format!("任务被中断: {reason:?}")),
        ..Default::default()
    }
}

/// 执行结果到终态的映射
pub fn settle(
    outcome: SchedulerResult<ExecutionOutcome>,
    interrupted: Option<InterruptReason>,
) -> (TaskExecutionStatus, TaskResult) {
    match outcome {
        Ok(ExecutionOutcome::Completed(result)) if result.is_success() => {
            (TaskExecutionStatus::Success, result)
        }
        Ok(ExecutionOutcome::Completed(result)) => (TaskExecutionStatus::Failure, result),
        Ok(ExecutionOutcome::Interrupted { reason, result }) => (status_for(reason), result),
        Err(e) => match interrupted {
            Some(reason) => (status_for(reason), failed_result(&e)),
            None => (TaskExecutionStatus::Failure, failed_result(&e)),
        },
    }
}

/// Worker 上的一次任务执行，由 [`crate::WorkerTaskExecutorFactory`] 创建
pub struct WorkerTaskExecutor {
    context: TaskExecutionContext,
    executor: Arc<dyn TaskExecutor>,
    worker_config: Arc<WorkerConfig>,
    message_sender: Arc<WorkerMessageSender>,
    storage: Option<Arc<dyn StorageOperator>>,
    registry_client: Arc<dyn WorkerRegistryClient>,
    handle: TaskExecutionHandle,
    interrupt: InterruptSignal,
}

impl WorkerTaskExecutor {
    pub(crate) fn new(
        mut context: TaskExecutionContext,
        executor: Arc<dyn TaskExecutor>,
        worker_config: Arc<WorkerConfig>,
        message_sender: Arc<WorkerMessageSender>,
        storage: Option<Arc<dyn StorageOperator>>,
        registry_client: Arc<dyn WorkerRegistryClient>,
    ) -> Self {
        let (handle, interrupt) = TaskExecutionHandle::new(context.task_instance_id);
        context.current_state = TaskExecutionStatus::Dispatched;
        context.host = message_sender.host().to_string();
        Self {
            context,
            executor,
            worker_config,
            message_sender,
            storage,
            registry_client,
            handle,
            interrupt,
        }
    }

    pub fn handle(&self) -> TaskExecutionHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &TaskExecutionContext {
        &self.context
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// 执行到终态并上报，返回最终状态
    pub async fn run(mut self) -> TaskExecutionStatus {
        let task_instance_id = self.context.task_instance_id;

        if let Err(e) = self.handle.transition(TaskExecutionStatus::Running) {
            warn!("任务 {} 无法进入运行状态: {}", task_instance_id, e);
        }
        self.context.current_state = self.handle.status();
        self.message_sender.send_running(&self.context).await;

        let (status, result) = self.execute().await;
        self.cleanup().await;
        self.registry_client.task_finished(task_instance_id);

        let status = match self.handle.transition(status) {
            Ok(status) => status,
            Err(e) => {
                warn!("任务 {} 终态转换失败: {}", task_instance_id, e);
                self.handle.status()
            }
        };
        self.context.current_state = status;
        counter!("worker_tasks_finished_total", "status" => status.as_str()).increment(1);
        info!(
            "任务 {} 执行结束: {} (耗时 {}ms)",
            task_instance_id, status, result.execution_time_ms
        );

        if let Err(e) = self
            .message_sender
            .send_finish(&self.context, status, &result)
            .await
        {
            error!("任务 {} 的结束消息未送达: {}", task_instance_id, e);
        }
        status
    }

    async fn execute(&mut self) -> (TaskExecutionStatus, TaskResult) {
        if let Some(reason) = self.interrupt.reason() {
            return (status_for(reason), interrupted_result(reason));
        }

        if self.context.dry_run {
            info!("任务 {} 为 dry run，只校验参数", self.context.task_instance_id);
            return match self.executor.validate(&self.context) {
                Ok(()) => (TaskExecutionStatus::Success, TaskResult::success("dry run")),
                Err(e) => (TaskExecutionStatus::Failure, failed_result(&e)),
            };
        }

        if let Err(e) = self.prepare().await {
            error!("任务 {} 准备执行环境失败: {}", self.context.task_instance_id, e);
            return (TaskExecutionStatus::Failure, failed_result(&e));
        }

        // 资源落地期间可能已经收到 kill
        if let Some(reason) = self.interrupt.reason() {
            return (status_for(reason), interrupted_result(reason));
        }

        self.execute_with_budget().await
    }

    fn work_dir(&self) -> PathBuf {
        Path::new(&self.worker_config.task_work_dir).join(self.context.task_instance_id.to_string())
    }

    /// 创建工作目录并落地资源文件
    async fn prepare(&mut self) -> SchedulerResult<()> {
        let work_dir = self.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;
        self.context.execute_path = Some(work_dir.to_string_lossy().into_owned());

        if !self.context.needs_resources() {
            return Ok(());
        }
        let storage = self.storage.as_ref().ok_or_else(|| {
            SchedulerError::InvalidTaskParams("任务需要资源文件，但Worker未配置存储".to_string())
        })?;
        for resource in &self.context.resource_files {
            let file_name = Path::new(resource).file_name().ok_or_else(|| {
                SchedulerError::InvalidTaskParams(format!("非法的资源路径: {resource}"))
            })?;
            storage.download(resource, &work_dir.join(file_name)).await?;
        }
        debug!(
            "任务 {} 的 {} 个资源文件已落地",
            self.context.task_instance_id,
            self.context.resource_files.len()
        );
        Ok(())
    }

    async fn execute_with_budget(&self) -> (TaskExecutionStatus, TaskResult) {
        let task_instance_id = self.context.task_instance_id;
        let grace = self.worker_config.kill_grace_period();
        let deadline = self
            .context
            .timeout_seconds
            .map(|seconds| Instant::now() + Duration::from_secs(seconds));

        let period = self.worker_config.running_report_interval();
        let mut report = tokio::time::interval_at(Instant::now() + period, period);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut watcher = self.interrupt.clone();
        let mut abandon_at: Option<Instant> = None;
        let mut timed_out = false;

        let execution = self.executor.execute(&self.context, self.interrupt.clone());
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !timed_out => {
                    timed_out = true;
                    warn!(
                        "任务 {} 超过执行时限 {:?}s，发出中断",
                        task_instance_id, self.context.timeout_seconds
                    );
                    self.handle.interrupt(InterruptReason::Timeout);
                }
                reason = watcher.triggered(), if abandon_at.is_none() => {
                    debug!("任务 {} 收到中断: {:?}", task_instance_id, reason);
                    abandon_at = Some(Instant::now() + grace * 2);
                }
                _ = sleep_until(abandon_at.unwrap_or_else(Instant::now)), if abandon_at.is_some() => {
                    // 执行器没有响应中断，丢弃执行 future
                    let reason = watcher.reason().unwrap_or(InterruptReason::Killed);
                    error!("任务 {} 的执行器未在宽限期内响应中断", task_instance_id);
                    break Ok(ExecutionOutcome::Interrupted {
                        reason,
                        result: interrupted_result(reason),
                    });
                }
                _ = report.tick() => {
                    self.message_sender.send_running(&self.context).await;
                }
            }
        };

        settle(outcome, self.handle.interrupt_reason())
    }

    async fn cleanup(&self) {
        let Some(path) = self.context.execute_path.as_ref() else {
            return;
        };
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            debug!("清理任务工作目录 {} 失败: {}", path, e);
        }
    }
}
