use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TransportConfig, WorkerConfig};
use scheduler_remote::{MessageChannel, RemoteClient};

use crate::execution_manager::TaskExecutionManager;
use crate::executor_factory::ExecutorRegistry;
use crate::executors::TaskExecutor;
use crate::heartbeat::HeartbeatManager;
use crate::registry_client::{InMemoryWorkerRegistryClient, WorkerRegistryClient};
use crate::storage::{LocalStorageOperator, StorageOperator};

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    config: WorkerConfig,
    transport: TransportConfig,
    executors: ExecutorRegistry,
    storage: Option<Arc<dyn StorageOperator>>,
    registry_client: Option<Arc<dyn WorkerRegistryClient>>,
}

impl WorkerServiceBuilder {
    pub fn new(mut config: WorkerConfig, transport: TransportConfig) -> Self {
        if config.hostname.is_empty() || config.hostname == "localhost" {
            config.hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
        }
        // 配置了存储目录时使用本地存储
        let storage = config
            .storage_base_dir
            .as_ref()
            .map(|dir| Arc::new(LocalStorageOperator::new(dir)) as Arc<dyn StorageOperator>);
        let executors = ExecutorRegistry::with_builtins(&config);

        Self {
            config,
            transport,
            executors,
            storage,
            registry_client: None,
        }
    }

    /// 注册自定义任务类型的执行器
    pub fn register_executor(
        self,
        task_type: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> SchedulerResult<Self> {
        self.executors.register(task_type, executor)?;
        Ok(self)
    }

    pub fn storage(mut self, storage: Arc<dyn StorageOperator>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry_client(mut self, registry_client: Arc<dyn WorkerRegistryClient>) -> Self {
        self.registry_client = Some(registry_client);
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerService> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::config_error(e.to_string()))?;

        let config = Arc::new(self.config);
        let registry_client = self
            .registry_client
            .unwrap_or_else(|| Arc::new(InMemoryWorkerRegistryClient::new(&config)));

        let mut client = None;
        let manager = TaskExecutionManager::with_channel(
            config.clone(),
            self.storage,
            registry_client.clone(),
            Arc::new(self.executors),
            |handlers| {
                let remote = Arc::new(RemoteClient::new(
                    config.master_address.clone(),
                    config.advertise_address.clone(),
                    handlers,
                    self.transport,
                ));
                client = Some(remote.clone());
                remote as Arc<dyn MessageChannel>
            },
        );
        let client =
            client.ok_or_else(|| SchedulerError::Internal("Worker连接未创建".to_string()))?;

        let heartbeat = Arc::new(HeartbeatManager::new(
            registry_client,
            manager.message_sender().clone(),
            config.heartbeat_interval(),
        ));

        Ok(WorkerService {
            config,
            client,
            manager,
            heartbeat,
        })
    }
}

/// Worker服务：连接 Master、上报心跳、执行分发来的任务
pub struct WorkerService {
    config: Arc<WorkerConfig>,
    client: Arc<RemoteClient>,
    manager: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
}

impl WorkerService {
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TaskExecutionManager> {
        &self.manager
    }

    /// 运行直到收到停机信号
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "启动Worker服务: worker_id={}, host={}, master={}, groups={:?}",
            self.config.worker_id,
            self.config.hostname,
            self.config.master_address,
            self.config.worker_groups
        );

        // 首次连接失败不退出，心跳会持续重连
        if let Err(e) = self.client.channel().await {
            warn!("连接Master {} 失败: {}", self.config.master_address, e);
        }

        let heartbeat_task = self.heartbeat.clone().start(shutdown_rx.resubscribe());

        let _ = shutdown_rx.recv().await;
        info!("Worker服务开始停止");

        self.manager.shutdown().await;
        if let Err(e) = heartbeat_task.await {
            warn!("心跳任务异常退出: {}", e);
        }
        self.client.close();

        info!("Worker服务已停止");
        Ok(())
    }
}
