//! Worker 端：接收 Master 分发的任务，执行并回报状态。

pub mod execution_manager;
pub mod executor_factory;
pub mod executors;
pub mod handlers;
pub mod heartbeat;
pub mod lifecycle;
pub mod message_sender;
pub mod registry_client;
pub mod service;
pub mod storage;

pub use execution_manager::{AcceptOutcome, TaskExecutionManager};
pub use executor_factory::{ExecutorRegistry, TaskKind, WorkerTaskExecutorFactory};
pub use executors::{
    ExecutionOutcome, HttpExecutor, HttpTaskParams, InterruptReason, InterruptSignal,
    ShellExecutor, ShellTaskParams, TaskExecutor,
};
pub use handlers::{worker_handlers, TaskExecuteStartHandler, TaskKillHandler};
pub use heartbeat::HeartbeatManager;
pub use lifecycle::{TaskExecutionHandle, WorkerTaskExecutor};
pub use message_sender::WorkerMessageSender;
pub use registry_client::{InMemoryWorkerRegistryClient, WorkerRegistryClient};
pub use service::{WorkerService, WorkerServiceBuilder};
pub use storage::{LocalStorageOperator, StorageOperator};
