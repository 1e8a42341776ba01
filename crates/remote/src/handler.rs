use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use scheduler_core::SchedulerResult;

use crate::channel::RemoteChannel;
use crate::message::{Message, MessageType};

/// 入站消息处理器
///
/// 返回 `Some(reply)` 时由通道负责回写应答。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: Message,
        channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>>;
}

/// 按消息类型路由的处理器表，连接建立前装配完成，之后只读
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(message_type, handler).is_some() {
            tracing::warn!("消息类型 {} 的处理器被覆盖", message_type);
        }
    }

    pub fn with(mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(message_type, handler);
        self
    }

    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&message_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 对 Ping 回 Pong
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        message: Message,
        _channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        Ok(Some(crate::command::pong(&message)))
    }
}
