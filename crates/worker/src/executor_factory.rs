use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use scheduler_core::{SchedulerError, SchedulerResult, TaskExecutionContext, WorkerConfig};

use crate::executors::{HttpExecutor, ShellExecutor, TaskExecutor};
use crate::lifecycle::WorkerTaskExecutor;
use crate::message_sender::WorkerMessageSender;
use crate::registry_client::WorkerRegistryClient;
use crate::storage::StorageOperator;

/// 任务类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Shell,
    Http,
    /// 通过 [`ExecutorRegistry::register`] 注册的类型，名称统一为小写
    Custom(String),
}

impl TaskKind {
    /// 按任务类型名选择，大小写不敏感
    pub fn from_task_type(task_type: &str) -> Self {
        let normalized = task_type.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "shell" => Self::Shell,
            "http" => Self::Http,
            _ => Self::Custom(normalized),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Shell => "shell",
            Self::Http => "http",
            Self::Custom(name) => name,
        }
    }
}

/// 任务类型到执行器的注册表
pub struct ExecutorRegistry {
    shell: Arc<dyn TaskExecutor>,
    http: Arc<dyn TaskExecutor>,
    custom: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new(shell: Arc<dyn TaskExecutor>, http: Arc<dyn TaskExecutor>) -> Self {
        Self {
            shell,
            http,
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// 内置的 Shell 和 HTTP 执行器
    pub fn with_builtins(config: &WorkerConfig) -> Self {
        Self::new(
            Arc::new(ShellExecutor::new(config.kill_grace_period())),
            Arc::new(HttpExecutor::new()),
        )
    }

    /// 注册自定义类型的执行器，返回被替换的旧执行器
    ///
    /// 内置类型名不能被覆盖。
    pub fn register(
        &self,
        task_type: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> SchedulerResult<Option<Arc<dyn TaskExecutor>>> {
        let TaskKind::Custom(name) = TaskKind::from_task_type(task_type) else {
            return Err(SchedulerError::config_error(format!(
                "不能覆盖内置任务类型: {task_type}"
            )));
        };
        if name.is_empty() {
            return Err(SchedulerError::config_error("任务类型不能为空"));
        }
        info!("注册执行器: {} -> {}", name, executor.name());
        Ok(self
            .custom
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, executor))
    }

    pub fn resolve(&self, kind: &TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        match kind {
            TaskKind::Shell => Some(self.shell.clone()),
            TaskKind::Http => Some(self.http.clone()),
            TaskKind::Custom(name) => self
                .custom
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(name)
                .cloned(),
        }
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.resolve(&TaskKind::from_task_type(task_type)).is_some()
    }

    pub fn supported_task_types(&self) -> Vec<String> {
        let mut types = vec!["shell".to_string(), "http".to_string()];
        let mut custom: Vec<String> = self
            .custom
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        custom.sort();
        types.extend(custom);
        types
    }
}

/// 为一次分发组装 [`WorkerTaskExecutor`]，本身不做任何执行
pub struct WorkerTaskExecutorFactory {
    context: TaskExecutionContext,
    worker_config: Arc<WorkerConfig>,
    message_sender: Arc<WorkerMessageSender>,
    storage: Option<Arc<dyn StorageOperator>>,
    registry_client: Arc<dyn WorkerRegistryClient>,
    executors: Option<Arc<ExecutorRegistry>>,
}

impl WorkerTaskExecutorFactory {
    pub fn new(
        context: TaskExecutionContext,
        worker_config: Arc<WorkerConfig>,
        message_sender: Arc<WorkerMessageSender>,
        storage: Option<Arc<dyn StorageOperator>>,
        registry_client: Arc<dyn WorkerRegistryClient>,
    ) -> Self {
        Self {
            context,
            worker_config,
            message_sender,
            storage,
            registry_client,
            executors: None,
        }
    }

    /// 使用共享的执行器注册表，缺省时只有内置执行器
    pub fn with_executors(mut self, executors: Arc<ExecutorRegistry>) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn create_worker_task_executor(self) -> SchedulerResult<WorkerTaskExecutor> {
        let kind = TaskKind::from_task_type(&self.context.task_type);
        let executors = self
            .executors
            .unwrap_or_else(|| Arc::new(ExecutorRegistry::with_builtins(&self.worker_config)));
        let executor = executors.resolve(&kind).ok_or_else(|| {
            SchedulerError::InvalidTaskParams(format!(
                "不支持的任务类型: {}",
                self.context.task_type
            ))
        })?;

        debug!(
            "任务 {} 使用执行器 {}",
            self.context.task_instance_id,
            executor.name()
        );
        Ok(WorkerTaskExecutor::new(
            self.context,
            executor,
            self.worker_config,
            self.message_sender,
            self.storage,
            self.registry_client,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_selection() {
        assert_eq!(TaskKind::from_task_type("SHELL"), TaskKind::Shell);
        assert_eq!(TaskKind::from_task_type("shell"), TaskKind::Shell);
        assert_eq!(TaskKind::from_task_type(" Http "), TaskKind::Http);
        assert_eq!(
            TaskKind::from_task_type("SQL"),
            TaskKind::Custom("sql".to_string())
        );
        assert_eq!(TaskKind::from_task_type("SQL").name(), "sql");
    }

    #[test]
    fn test_builtin_types_cannot_be_replaced() {
        let registry = ExecutorRegistry::with_builtins(&WorkerConfig::default());
        let http: Arc<dyn TaskExecutor> = Arc::new(HttpExecutor::new());
        assert!(registry.register("Shell", http.clone()).is_err());
        assert!(registry.register("", http).is_err());
    }

    #[test]
    fn test_custom_registration() {
        let registry = ExecutorRegistry::with_builtins(&WorkerConfig::default());
        assert!(!registry.supports("webhook"));

        let previous = registry
            .register("WEBHOOK", Arc::new(HttpExecutor::new()))
            .unwrap();
        assert!(previous.is_none());
        assert!(registry.supports("webhook"));
        assert_eq!(
            registry.supported_task_types(),
            vec!["shell".to_string(), "http".to_string(), "webhook".to_string()]
        );
    }
}
