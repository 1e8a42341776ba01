//! 类型化的消息体
//!
//! 消息体统一用 JSON 编码，消息类型与消息体类型一一对应。

mod heartbeat;
mod kill;
mod task;

pub use heartbeat::*;
pub use kill::*;
pub use task::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

use scheduler_core::SchedulerResult;

use crate::message::{Message, MessageContext, MessageType};

pub trait MessageBody: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;

    fn to_body(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 包装为新请求（取新的 opaque）
    fn to_request(&self, context: MessageContext) -> SchedulerResult<Message> {
        Ok(Message::request(Self::MESSAGE_TYPE, context, self.to_body()?))
    }

    /// 包装为对 `request` 的应答
    fn to_reply(&self, request: &Message) -> SchedulerResult<Message> {
        Ok(Message::reply_to(request, Self::MESSAGE_TYPE, self.to_body()?))
    }
}

/// 心跳探测，消息体为空
pub fn ping(context: MessageContext) -> Message {
    Message::request(MessageType::Ping, context, Vec::new())
}

pub fn pong(request: &Message) -> Message {
    Message::reply_to(request, MessageType::Pong, Vec::new())
}
