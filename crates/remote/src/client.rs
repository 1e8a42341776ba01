use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TransportConfig};

use crate::channel::{MessageChannel, RemoteChannel};
use crate::handler::HandlerRegistry;
use crate::message::Message;
use crate::retry::RetryPolicy;

/// 主动连接一端（Worker → Master）
///
/// 按需建立连接，通道断开后下一次使用时带退避重连。
pub struct RemoteClient {
    server_address: String,
    local_address: String,
    handlers: Arc<HandlerRegistry>,
    config: TransportConfig,
    current: RwLock<Option<RemoteChannel>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl RemoteClient {
    pub fn new(
        server_address: impl Into<String>,
        local_address: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            server_address: server_address.into(),
            local_address: local_address.into(),
            handlers,
            config,
            current: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    fn active_channel(&self) -> Option<RemoteChannel> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|channel| channel.is_active())
            .cloned()
    }

    /// 返回可用的通道，必要时重连
    pub async fn channel(&self) -> SchedulerResult<RemoteChannel> {
        if let Some(channel) = self.active_channel() {
            return Ok(channel);
        }

        let _connecting = self.connect_lock.lock().await;
        // 等锁期间可能已经有人连上
        if let Some(channel) = self.active_channel() {
            return Ok(channel);
        }

        let channel = self.connect_with_backoff().await?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(channel.clone());
        Ok(channel)
    }

    async fn connect_with_backoff(&self) -> SchedulerResult<RemoteChannel> {
        let policy = RetryPolicy::new(
            self.config.reconnect_max_attempts,
            Duration::from_millis(self.config.reconnect_base_delay_ms),
            Duration::from_millis(self.config.reconnect_max_delay_ms),
        );

        let result = policy
            .run("connect", |attempt| async move {
                let channel = self.connect_once().await;
                if let Err(e) = &channel {
                    warn!("连接 {} 失败 (第 {} 次): {}", self.server_address, attempt, e);
                }
                channel
            })
            .await;

        match result {
            Ok(channel) => {
                info!("已连接到 {}", self.server_address);
                Ok(channel)
            }
            Err(SchedulerError::DeliveryFailed { attempts, reason, .. }) => {
                Err(SchedulerError::Network(format!(
                    "连接 {} 失败，已尝试 {} 次: {}",
                    self.server_address, attempts, reason
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_once(&self) -> SchedulerResult<RemoteChannel> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&self.server_address),
        )
        .await
        .map_err(|_| SchedulerError::Network(format!("连接 {} 超时", self.server_address)))??;

        RemoteChannel::from_tcp(
            stream,
            self.local_address.clone(),
            Arc::clone(&self.handlers),
            &self.config,
        )
    }

    pub fn close(&self) {
        if let Some(channel) = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            channel.close();
        }
    }
}

#[async_trait]
impl MessageChannel for RemoteClient {
    async fn send(&self, message: Message) -> SchedulerResult<()> {
        self.channel().await?.send(message).await
    }

    async fn send_and_await_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> SchedulerResult<Message> {
        self.channel()
            .await?
            .send_and_await_reply(message, timeout)
            .await
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn remote_address(&self) -> String {
        self.server_address.clone()
    }

    fn is_active(&self) -> bool {
        self.active_channel().is_some()
    }
}
