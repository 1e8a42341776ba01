use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use scheduler_core::SchedulerResult;

use crate::message_sender::WorkerMessageSender;
use crate::registry_client::WorkerRegistryClient;

/// 定期向 Master 上报心跳
///
/// Master 依据心跳登记 Worker 的连接，第一次心跳在启动后立即发出。
pub struct HeartbeatManager {
    registry_client: Arc<dyn WorkerRegistryClient>,
    message_sender: Arc<WorkerMessageSender>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        registry_client: Arc<dyn WorkerRegistryClient>,
        message_sender: Arc<WorkerMessageSender>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry_client,
            message_sender,
            heartbeat_interval,
        }
    }

    pub async fn send_heartbeat(&self) -> SchedulerResult<()> {
        let heartbeat = self.registry_client.heartbeat();
        debug!(
            "发送心跳: worker_id={}, 运行中 {}/{}",
            heartbeat.worker_id, heartbeat.running_tasks, heartbeat.max_concurrent_tasks
        );
        self.message_sender.send_heartbeat(&heartbeat).await
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.send_heartbeat().await {
                            warn!("发送心跳失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务退出");
                        break;
                    }
                }
            }
        })
    }
}
