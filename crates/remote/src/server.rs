use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TransportConfig};

use crate::channel::RemoteChannel;
use crate::handler::HandlerRegistry;

/// 按 Worker 公布地址登记的通道表，用于 Master 主动推送
#[derive(Clone, Default)]
pub struct ChannelDirectory {
    channels: Arc<RwLock<HashMap<String, RemoteChannel>>>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, channel: RemoteChannel) {
        let address = address.into();
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let replaced = channels.insert(address.clone(), channel);
        if replaced.is_none() {
            info!("登记Worker通道: {}", address);
        }
    }

    /// 取出仍然可用的通道，已断开的顺手清理
    pub fn get(&self, address: &str) -> Option<RemoteChannel> {
        let channel = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(address)
            .cloned()?;
        if channel.is_active() {
            Some(channel)
        } else {
            self.remove(address);
            None
        }
    }

    pub fn remove(&self, address: &str) -> Option<RemoteChannel> {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(address)
    }

    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 被动接受连接的一端（Master）
pub struct RemoteServer {
    listener: TcpListener,
    local_address: String,
    handlers: Arc<HandlerRegistry>,
    config: TransportConfig,
}

impl RemoteServer {
    pub async fn bind(
        listen_address: &str,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> SchedulerResult<Self> {
        let listener = TcpListener::bind(listen_address).await.map_err(|e| {
            SchedulerError::Network(format!("监听 {listen_address} 失败: {e}"))
        })?;
        let local_address = listener.local_addr()?.to_string();
        info!("远程通信服务监听于 {}", local_address);

        Ok(Self {
            listener,
            local_address,
            handlers,
            config,
        })
    }

    pub fn local_addr(&self) -> SchedulerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到关闭信号，关闭时断开所有已建立的通道
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let mut accepted: Vec<RemoteChannel> = Vec::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            match RemoteChannel::from_tcp(
                                stream,
                                self.local_address.clone(),
                                Arc::clone(&self.handlers),
                                &self.config,
                            ) {
                                Ok(channel) => {
                                    debug!("接受来自 {} 的连接", peer);
                                    accepted.retain(|c| c.is_active());
                                    accepted.push(channel);
                                }
                                Err(e) => warn!("建立通道失败 ({}): {}", peer, e),
                            }
                        }
                        Err(e) => error!("接受连接失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("远程通信服务收到关闭信号");
                    break;
                }
            }
        }

        for channel in accepted {
            channel.close();
        }
        Ok(())
    }
}
