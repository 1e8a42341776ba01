use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::split;

use scheduler_core::{
    SchedulerError, SchedulerResult, TaskExecutionContext, TaskExecutionStatus, TransportConfig,
    WorkerConfig,
};
use scheduler_remote::{HandlerRegistry, MessageChannel, RemoteChannel};
use scheduler_worker::{
    ExecutionOutcome, ExecutorRegistry, InMemoryWorkerRegistryClient, InterruptSignal,
    TaskExecutor, WorkerMessageSender, WorkerRegistryClient, WorkerTaskExecutorFactory,
};

struct SqlExecutor;

#[async_trait]
impl TaskExecutor for SqlExecutor {
    fn name(&self) -> &str {
        "sql"
    }

    fn validate(&self, context: &TaskExecutionContext) -> SchedulerResult<()> {
        context
            .param("sql")
            .map(|_| ())
            .ok_or_else(|| SchedulerError::InvalidTaskParams("缺少sql".to_string()))
    }

    async fn execute(
        &self,
        _context: &TaskExecutionContext,
        _interrupt: InterruptSignal,
    ) -> SchedulerResult<ExecutionOutcome> {
        Err(SchedulerError::TaskExecution("not connected".to_string()))
    }
}

struct Parts {
    config: Arc<WorkerConfig>,
    sender: Arc<WorkerMessageSender>,
    registry: Arc<dyn WorkerRegistryClient>,
    _peer: RemoteChannel,
}

fn parts() -> Parts {
    let config = Arc::new(WorkerConfig {
        advertise_address: "worker:1234".to_string(),
        ..Default::default()
    });
    let transport = TransportConfig::default();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = split(a);
    let (br, bw) = split(b);
    let peer = RemoteChannel::spawn(
        ar,
        aw,
        "master:5678",
        "worker:1234",
        Arc::new(HandlerRegistry::new()),
        &transport,
    );
    let channel: Arc<dyn MessageChannel> = Arc::new(RemoteChannel::spawn(
        br,
        bw,
        "worker:1234",
        "master:5678",
        Arc::new(HandlerRegistry::new()),
        &transport,
    ));

    Parts {
        sender: Arc::new(WorkerMessageSender::new(channel, &config)),
        registry: Arc::new(InMemoryWorkerRegistryClient::new(&config)),
        config,
        _peer: peer,
    }
}

fn factory(parts: &Parts, context: TaskExecutionContext) -> WorkerTaskExecutorFactory {
    WorkerTaskExecutorFactory::new(
        context,
        parts.config.clone(),
        parts.sender.clone(),
        None,
        parts.registry.clone(),
    )
}

#[tokio::test]
async fn test_factory_selects_builtin_executors() {
    let parts = parts();

    let executor = factory(&parts, TaskExecutionContext::new(1, "t", "SHELL"))
        .create_worker_task_executor()
        .unwrap();
    assert_eq!(executor.executor_name(), "shell");
    assert_eq!(executor.context().current_state, TaskExecutionStatus::Dispatched);
    assert_eq!(executor.context().host, "worker:1234");
    assert_eq!(executor.handle().status(), TaskExecutionStatus::Dispatched);

    let executor = factory(&parts, TaskExecutionContext::new(2, "t", "http"))
        .create_worker_task_executor()
        .unwrap();
    assert_eq!(executor.executor_name(), "http");
}

#[tokio::test]
async fn test_factory_rejects_unknown_task_type() {
    let parts = parts();
    let result = factory(&parts, TaskExecutionContext::new(3, "t", "SQL"))
        .create_worker_task_executor();
    assert!(matches!(result, Err(SchedulerError::InvalidTaskParams(_))));
}

#[tokio::test]
async fn test_factory_uses_registered_custom_executor() {
    let parts = parts();
    let executors = Arc::new(ExecutorRegistry::with_builtins(&parts.config));
    executors.register("sql", Arc::new(SqlExecutor)).unwrap();

    let executor = factory(&parts, TaskExecutionContext::new(4, "t", "SQL"))
        .with_executors(executors)
        .create_worker_task_executor()
        .unwrap();
    assert_eq!(executor.executor_name(), "sql");
}

#[tokio::test]
async fn test_factory_does_not_start_execution() {
    let parts = parts();
    let executor = factory(&parts, TaskExecutionContext::new(5, "t", "SHELL"))
        .create_worker_task_executor()
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(executor.handle().status(), TaskExecutionStatus::Dispatched);
    assert_eq!(parts.registry.running_tasks(), 0);
}
