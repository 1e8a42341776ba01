use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use scheduler_core::AppConfig;
use scheduler_dispatcher::{
    HeartBeatHandler, InMemoryScheduleRepository, InMemoryWorkflowDefinitionLookup,
    LoggingInstanceCreator, ScheduleService, SystemClock, TaskEventHandler, TaskEventTracker,
};
use scheduler_remote::{ChannelDirectory, HandlerRegistry, MessageType, PingHandler, RemoteServer};
use scheduler_worker::WorkerServiceBuilder;

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 调度触发与任务分发
    Master,
    /// 仅执行任务
    Worker,
    /// 同一进程内同时运行
    All,
}

impl AppMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "master" | "dispatcher" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "all" => Ok(Self::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }

    fn runs_master(self) -> bool {
        matches!(self, Self::Master | Self::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(mut config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        if mode.runs_worker() {
            config.worker.enabled = true;
        }
        config.validate().context("配置校验失败")?;
        Ok(Self { config, mode })
    }

    /// 启动各组件并等待停机信号
    pub async fn run(self, shutdown: ShutdownManager) -> Result<()> {
        let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        if self.mode.runs_master() {
            for (name, task) in self.start_master(&shutdown).await? {
                tasks.push((name, task));
            }
        }

        if self.mode.runs_worker() {
            let service =
                WorkerServiceBuilder::new(self.config.worker.clone(), self.config.transport.clone())
                    .build()
                    .context("创建Worker服务失败")?;
            let shutdown_rx = shutdown.subscribe();
            tasks.push((
                "worker",
                tokio::spawn(async move { service.run(shutdown_rx).await.map_err(Into::into) }),
            ));
        }

        info!("应用程序启动完成，共 {} 个组件", tasks.len());

        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => info!("组件 {} 已停止", name),
                Ok(Err(e)) => error!("组件 {} 运行失败: {:#}", name, e),
                Err(e) => error!("组件 {} 异常退出: {}", name, e),
            }
        }

        info!("应用程序已停止");
        Ok(())
    }

    async fn start_master(
        &self,
        shutdown: &ShutdownManager,
    ) -> Result<Vec<(&'static str, JoinHandle<Result<()>>)>> {
        let config = &self.config;
        let directory = ChannelDirectory::new();
        let tracker = Arc::new(TaskEventTracker::new());

        let heartbeats = Arc::new(HeartBeatHandler::new(directory.clone()));
        let events = Arc::new(TaskEventHandler::new(tracker.clone()));
        let handlers = HandlerRegistry::new()
            .with(MessageType::HeartBeat, heartbeats)
            .with(MessageType::TaskExecuteStarted, events.clone())
            .with(MessageType::TaskExecuteRunning, events.clone())
            .with(MessageType::TaskExecuteFinish, events.clone())
            .with(MessageType::TaskReject, events)
            .with(MessageType::Ping, Arc::new(PingHandler));

        let server = RemoteServer::bind(
            &config.dispatcher.listen_address,
            Arc::new(handlers),
            config.transport.clone(),
        )
        .await
        .context("启动Master通信服务失败")?;

        // 定义存储和工作流实例创建由外部系统提供：定义放在内存里，触发事件只记日志和指标。
        // 任务分发由外部的工作流编排通过 TaskDispatcher 发起，这里只接收 Worker 上报
        let schedules = Arc::new(ScheduleService::new(
            Arc::new(InMemoryScheduleRepository::new()),
            Arc::new(InMemoryWorkflowDefinitionLookup::new()),
            Arc::new(LoggingInstanceCreator::new()),
            Arc::new(SystemClock),
            config.dispatcher.clone(),
        ));
        let recovered = schedules
            .recover(Utc::now())
            .await
            .context("恢复调度状态失败")?;
        info!("调度状态恢复完成: {:?}", recovered);

        let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        let shutdown_rx = shutdown.subscribe();
        tasks.push((
            "remote-server",
            tokio::spawn(async move { server.run(shutdown_rx).await.map_err(Into::into) }),
        ));

        let shutdown_rx = shutdown.subscribe();
        tasks.push((
            "schedule-trigger",
            tokio::spawn(async move {
                schedules.run(shutdown_rx).await;
                Ok(())
            }),
        ));

        let report_timeout = config.dispatcher.task_report_timeout_seconds;
        let shutdown_rx = shutdown.subscribe();
        tasks.push((
            "stale-task-watcher",
            tokio::spawn(watch_stale_tasks(tracker, report_timeout, shutdown_rx)),
        ));

        Ok(tasks)
    }
}

/// 定期检查长时间没有上报的运行中任务
async fn watch_stale_tasks(
    tracker: Arc<TaskEventTracker>,
    report_timeout_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let timeout = chrono::Duration::seconds(report_timeout_seconds as i64);
    let period = Duration::from_secs((report_timeout_seconds / 2).max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for task in tracker.stale_tasks(Utc::now(), timeout) {
                    warn!(
                        "任务 {} 在 Worker {} 上超过 {} 秒没有上报，最后状态 {:?}",
                        task.task_instance_id,
                        task.worker_address,
                        report_timeout_seconds,
                        task.status
                    );
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}
