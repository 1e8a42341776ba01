//! Master 与 Worker 之间的远程通信：消息信封、分帧、请求/应答关联和连接管理。

pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod handler;
pub mod message;
pub mod opaque;
pub mod retry;
pub mod server;

pub use channel::{MessageChannel, RemoteChannel};
pub use client::RemoteClient;
pub use codec::FrameCodec;
pub use command::MessageBody;
pub use handler::{HandlerRegistry, MessageHandler, PingHandler};
pub use message::{ExchangeKey, Message, MessageContext, MessageType, CURRENT_VERSION, MAGIC};
pub use opaque::{AtomicOpaqueGenerator, OpaqueGenerator};
pub use retry::RetryPolicy;
pub use server::{ChannelDirectory, RemoteServer};
