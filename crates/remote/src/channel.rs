//! 传输与关联层
//!
//! 每条连接拆成读写两个后台任务：写任务顺序发送出站帧，读任务解码入站帧，
//! 应答按 opaque 唤醒等待方，其余消息按类型交给处理器。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TransportConfig};

use crate::codec::FrameCodec;
use crate::handler::HandlerRegistry;
use crate::message::{ExchangeKey, Message};

/// 消息通道抽象，Worker 发送器与 Master 分发器都只依赖它
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// 交给发送队列即返回
    async fn send(&self, message: Message) -> SchedulerResult<()>;

    /// 发送并等待同 opaque 的应答
    async fn send_and_await_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> SchedulerResult<Message>;

    fn local_address(&self) -> String;

    fn remote_address(&self) -> String;

    fn is_active(&self) -> bool;
}

type Waiter = oneshot::Sender<SchedulerResult<Message>>;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, Waiter>,
    closed: Option<String>,
}

/// 等待关闭标记，不把 `watch::Ref` 带出 await 点
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// 最近见过的入站交换，超出容量后淘汰最早的
struct DedupWindow {
    capacity: usize,
    order: VecDeque<ExchangeKey>,
    seen: HashSet<ExchangeKey>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// 首次出现返回 true
    fn observe(&mut self, key: ExchangeKey) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

struct ChannelInner {
    local_address: String,
    remote_address: String,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Mutex<PendingTable>,
    dedup: Mutex<DedupWindow>,
    handlers: Arc<HandlerRegistry>,
    codec: FrameCodec,
    closed_tx: watch::Sender<bool>,
}

/// 一条已建立连接上的双向消息通道，克隆共享同一连接
#[derive(Clone)]
pub struct RemoteChannel {
    inner: Arc<ChannelInner>,
}

impl RemoteChannel {
    /// 在任意读写半部上启动通道，生产环境是 TCP，测试中是内存管道
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        local_address: impl Into<String>,
        remote_address: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        config: &TransportConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer_size.max(1));
        let (closed_tx, _) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                local_address: local_address.into(),
                remote_address: remote_address.into(),
                outbound: outbound_tx,
                pending: Mutex::new(PendingTable::default()),
                dedup: Mutex::new(DedupWindow::new(config.dedup_window_size)),
                handlers,
                codec: FrameCodec::new(config.max_frame_size_bytes),
                closed_tx,
            }),
        };

        tokio::spawn(channel.clone().write_loop(writer, outbound_rx));
        tokio::spawn(channel.clone().read_loop(reader));

        debug!(
            "通道已建立: {} <-> {}",
            channel.inner.local_address, channel.inner.remote_address
        );
        channel
    }

    pub fn from_tcp(
        stream: TcpStream,
        local_address: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        config: &TransportConfig,
    ) -> SchedulerResult<Self> {
        let _ = stream.set_nodelay(true);
        let remote_address = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self::spawn(
            reader,
            writer,
            local_address,
            remote_address,
            handlers,
            config,
        ))
    }

    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn is_active(&self) -> bool {
        !*self.inner.closed_tx.borrow()
    }

    /// 当前等待应答的请求数
    pub fn pending_requests(&self) -> usize {
        self.lock_pending().waiters.len()
    }

    pub async fn send(&self, message: Message) -> SchedulerResult<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(SchedulerError::ConnectionLost(reason));
        }

        let frame = message.encode()?;
        let max = self.inner.codec.max_frame_size();
        if frame.len() > max {
            return Err(SchedulerError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }

        self.inner.outbound.send(frame).await.map_err(|_| {
            SchedulerError::ConnectionLost(format!("到 {} 的发送队列已关闭", self.remote_address()))
        })
    }

    pub async fn send_and_await_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> SchedulerResult<Message> {
        let opaque = message.opaque;
        let receiver = self.register_waiter(opaque)?;
        let _guard = PendingGuard {
            channel: self,
            opaque,
        };

        self.send(message).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SchedulerError::ConnectionLost(format!(
                "等待 opaque={opaque} 的应答时通道关闭"
            ))),
            Err(_) => {
                counter!("remote_request_timeouts_total").increment(1);
                Err(SchedulerError::RequestTimeout {
                    opaque,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 主动关闭通道，所有等待方收到 ConnectionLost
    pub fn close(&self) {
        self.mark_closed("通道被本地关闭".to_string());
    }

    /// 通道关闭后返回
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        wait_closed(&mut rx).await;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_reason(&self) -> Option<String> {
        self.lock_pending().closed.clone()
    }

    fn register_waiter(
        &self,
        opaque: u64,
    ) -> SchedulerResult<oneshot::Receiver<SchedulerResult<Message>>> {
        let mut pending = self.lock_pending();
        if let Some(reason) = &pending.closed {
            return Err(SchedulerError::ConnectionLost(reason.clone()));
        }
        if pending.waiters.contains_key(&opaque) {
            return Err(SchedulerError::DuplicateCorrelationId { opaque });
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(opaque, tx);
        Ok(rx)
    }

    fn take_waiter(&self, opaque: u64) -> Option<Waiter> {
        self.lock_pending().waiters.remove(&opaque)
    }

    fn mark_closed(&self, reason: String) {
        let drained: Vec<Waiter> = {
            let mut pending = self.lock_pending();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.clone());
            pending.waiters.drain().map(|(_, waiter)| waiter).collect()
        };

        if !drained.is_empty() {
            warn!(
                "通道 {} 关闭，{} 个等待中的请求失败: {}",
                self.remote_address(),
                drained.len(),
                reason
            );
        }
        for waiter in drained {
            let _ = waiter.send(Err(SchedulerError::ConnectionLost(reason.clone())));
        }

        self.inner.closed_tx.send_replace(true);
        info!("通道已关闭: {} ({})", self.remote_address(), reason);
    }

    async fn write_loop<W>(self, mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.inner.codec.write_frame(&mut writer, &frame).await {
                        self.mark_closed(format!("写入失败: {e}"));
                        break;
                    }
                }
                _ = wait_closed(&mut closed_rx) => break,
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn read_loop<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        loop {
            let frame = tokio::select! {
                frame = self.inner.codec.read_frame(&mut reader) => frame,
                _ = wait_closed(&mut closed_rx) => break,
            };

            match frame {
                Ok(Some(bytes)) => self.dispatch_frame(&bytes),
                Ok(None) => {
                    self.mark_closed("对端关闭连接".to_string());
                    break;
                }
                Err(e) => {
                    self.mark_closed(e.to_string());
                    break;
                }
            }
        }
    }

    fn dispatch_frame(&self, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("丢弃无法解码的消息帧 (来自 {}): {}", self.remote_address(), e);
                counter!("remote_frames_dropped_total", "reason" => "decode").increment(1);
                return;
            }
        };

        if message.message_type.is_reply() {
            match self.take_waiter(message.opaque) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(message));
                }
                None => {
                    let err = SchedulerError::UnmatchedCorrelationId {
                        opaque: message.opaque,
                    };
                    debug!("丢弃迟到或未知的应答 {}: {}", message, err);
                    counter!("remote_frames_dropped_total", "reason" => "unmatched").increment(1);
                }
            }
            return;
        }

        if !message.message_type.is_known() {
            warn!("丢弃未知类型的消息: {}", message);
            counter!("remote_frames_dropped_total", "reason" => "unknown_type").increment(1);
            return;
        }

        let first_seen = self
            .inner
            .dedup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(message.exchange_key());
        if !first_seen {
            warn!(
                "丢弃重复的消息: {} (sender={})",
                message, message.context.sender_address
            );
            counter!("remote_frames_dropped_total", "reason" => "duplicate").increment(1);
            return;
        }

        let Some(handler) = self.inner.handlers.get(message.message_type) else {
            warn!("没有处理器，丢弃消息: {}", message);
            counter!("remote_frames_dropped_total", "reason" => "no_handler").increment(1);
            return;
        };

        let channel = self.clone();
        tokio::spawn(async move {
            let description = message.to_string();
            match handler.handle(message, &channel).await {
                Ok(Some(reply)) => {
                    if let Err(e) = channel.send(reply).await {
                        warn!("回写应答失败 {}: {}", description, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("处理消息失败 {}: {}", description, e),
            }
        });
    }
}

impl std::fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("local_address", &self.inner.local_address)
            .field("remote_address", &self.inner.remote_address)
            .field("active", &self.is_active())
            .finish()
    }
}

/// 请求结束（应答、超时或取消）时移除等待项
struct PendingGuard<'a> {
    channel: &'a RemoteChannel,
    opaque: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.take_waiter(self.opaque);
    }
}

#[async_trait]
impl MessageChannel for RemoteChannel {
    async fn send(&self, message: Message) -> SchedulerResult<()> {
        RemoteChannel::send(self, message).await
    }

    async fn send_and_await_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> SchedulerResult<Message> {
        RemoteChannel::send_and_await_reply(self, message, timeout).await
    }

    fn local_address(&self) -> String {
        self.inner.local_address.clone()
    }

    fn remote_address(&self) -> String {
        self.inner.remote_address.clone()
    }

    fn is_active(&self) -> bool {
        RemoteChannel::is_active(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sender: &str, opaque: u64) -> ExchangeKey {
        ExchangeKey {
            sender_address: sender.to_string(),
            opaque,
        }
    }

    #[test]
    fn test_dedup_window_drops_repeats() {
        let mut window = DedupWindow::new(2);
        assert!(window.observe(key("a", 1)));
        assert!(!window.observe(key("a", 1)));
        assert!(window.observe(key("b", 1)));
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        assert!(window.observe(key("a", 1)));
        assert!(window.observe(key("a", 2)));
        assert!(window.observe(key("a", 3)));
        assert!(window.observe(key("a", 1)));
        assert!(!window.observe(key("a", 3)));
    }

    #[test]
    fn test_dedup_disabled_with_zero_capacity() {
        let mut window = DedupWindow::new(0);
        assert!(window.observe(key("a", 1)));
        assert!(window.observe(key("a", 1)));
    }

    #[tokio::test]
    async fn test_closed_can_be_awaited_from_spawned_task() {
        let (a, _b) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(a);
        let channel = RemoteChannel::spawn(
            reader,
            writer,
            "local:1",
            "remote:2",
            Arc::new(HandlerRegistry::new()),
            &TransportConfig::default(),
        );

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.closed().await })
        };
        assert!(channel.is_active());
        channel.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!channel.is_active());
    }
}
