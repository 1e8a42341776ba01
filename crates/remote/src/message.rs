//! 消息信封及其二进制编解码
//!
//! 线上格式（大端序）：
//!
//! ```text
//! [u8 magic][u8 version][u16 type][u64 opaque]
//! [u16 len][sender utf8][u16 len][receiver utf8][i64 send_time_millis]
//! [body ...]   // 长度由外层帧决定
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;

use scheduler_core::{SchedulerError, SchedulerResult};

use crate::opaque::{self, OpaqueGenerator};

/// 协议标识
pub const MAGIC: u8 = 0xbe;
/// 本构建支持的最高协议版本
pub const CURRENT_VERSION: u8 = 0;

const FIXED_HEADER_LEN: usize = 1 + 1 + 2 + 8;

/// 消息类型
///
/// 未识别的类型保留原始标签，信封照常解码，只有解释消息体时才报错。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Master → Worker 任务分发
    TaskExecuteStart,
    TaskExecuteStarted,
    TaskExecuteRunning,
    TaskExecuteFinish,
    /// 对分发和生命周期上报的确认
    TaskEventAck,
    TaskKill,
    TaskKillResponse,
    TaskReject,
    HeartBeat,
    Ping,
    Pong,
    Unknown(u16),
}

impl MessageType {
    pub fn tag(self) -> u16 {
        match self {
            Self::TaskExecuteStart => 1,
            Self::TaskExecuteStarted => 2,
            Self::TaskExecuteRunning => 3,
            Self::TaskExecuteFinish => 4,
            Self::TaskEventAck => 5,
            Self::TaskKill => 6,
            Self::TaskKillResponse => 7,
            Self::TaskReject => 8,
            Self::HeartBeat => 9,
            Self::Ping => 10,
            Self::Pong => 11,
            Self::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: u16) -> Self {
        match tag {
            1 => Self::TaskExecuteStart,
            2 => Self::TaskExecuteStarted,
            3 => Self::TaskExecuteRunning,
            4 => Self::TaskExecuteFinish,
            5 => Self::TaskEventAck,
            6 => Self::TaskKill,
            7 => Self::TaskKillResponse,
            8 => Self::TaskReject,
            9 => Self::HeartBeat,
            10 => Self::Ping,
            11 => Self::Pong,
            other => Self::Unknown(other),
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// 应答类型只用于唤醒等待中的请求，不会交给处理器
    pub fn is_reply(self) -> bool {
        matches!(self, Self::TaskEventAck | Self::TaskKillResponse | Self::Pong)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(tag) => write!(f, "UNKNOWN({tag})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// 消息上下文
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageContext {
    pub sender_address: String,
    pub receiver_address: String,
    pub send_time_millis: i64,
}

impl MessageContext {
    pub fn new(sender_address: impl Into<String>, receiver_address: impl Into<String>) -> Self {
        Self {
            sender_address: sender_address.into(),
            receiver_address: receiver_address.into(),
            send_time_millis: Utc::now().timestamp_millis(),
        }
    }
}

/// 去重标识：同一发送方的同一 opaque 视为同一次交换
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub sender_address: String,
    pub opaque: u64,
}

/// 消息信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub message_type: MessageType,
    pub opaque: u64,
    pub context: MessageContext,
    pub body: Vec<u8>,
}

impl Message {
    /// 新建请求，从进程级生成器取一个新的 opaque
    pub fn request(message_type: MessageType, context: MessageContext, body: Vec<u8>) -> Self {
        Self::with_opaque(opaque::next_opaque(), message_type, context, body)
    }

    pub fn request_with(
        generator: &dyn OpaqueGenerator,
        message_type: MessageType,
        context: MessageContext,
        body: Vec<u8>,
    ) -> Self {
        Self::with_opaque(generator.next_opaque(), message_type, context, body)
    }

    /// 构造应答：沿用请求的 opaque，收发地址互换
    pub fn reply_to(request: &Message, message_type: MessageType, body: Vec<u8>) -> Self {
        let context = MessageContext::new(
            request.context.receiver_address.clone(),
            request.context.sender_address.clone(),
        );
        Self::with_opaque(request.opaque, message_type, context, body)
    }

    fn with_opaque(
        opaque: u64,
        message_type: MessageType,
        context: MessageContext,
        body: Vec<u8>,
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            message_type,
            opaque,
            context,
            body,
        }
    }

    pub fn exchange_key(&self) -> ExchangeKey {
        ExchangeKey {
            sender_address: self.context.sender_address.clone(),
            opaque: self.opaque,
        }
    }

    pub fn is_same_exchange(&self, other: &Message) -> bool {
        self.opaque == other.opaque
            && self.context.sender_address == other.context.sender_address
    }

    /// 按消息类型解释消息体
    pub fn body_as<T>(&self) -> SchedulerResult<T>
    where
        T: crate::command::MessageBody + DeserializeOwned,
    {
        if let MessageType::Unknown(tag) = self.message_type {
            return Err(SchedulerError::UnknownMessageType { tag });
        }
        if self.message_type != T::MESSAGE_TYPE {
            return Err(SchedulerError::MalformedMessage(format!(
                "消息类型 {} 不能解释为 {}",
                self.message_type,
                T::MESSAGE_TYPE
            )));
        }
        serde_json::from_slice(&self.body).map_err(|e| {
            SchedulerError::Serialization(format!("解析 {} 消息体失败: {e}", self.message_type))
        })
    }

    pub fn encode(&self) -> SchedulerResult<Vec<u8>> {
        let sender = self.context.sender_address.as_bytes();
        let receiver = self.context.receiver_address.as_bytes();
        let mut buf = Vec::with_capacity(
            FIXED_HEADER_LEN + 2 + sender.len() + 2 + receiver.len() + 8 + self.body.len(),
        );

        buf.push(MAGIC);
        buf.push(self.version);
        buf.extend_from_slice(&self.message_type.tag().to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        put_str(&mut buf, sender)?;
        put_str(&mut buf, receiver)?;
        buf.extend_from_slice(&self.context.send_time_millis.to_be_bytes());
        buf.extend_from_slice(&self.body);

        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> SchedulerResult<Message> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.read_u8()?;
        if magic != MAGIC {
            return Err(SchedulerError::ProtocolMismatch {
                expected: MAGIC,
                actual: magic,
            });
        }

        let version = reader.read_u8()?;
        if version > CURRENT_VERSION {
            return Err(SchedulerError::UnsupportedVersion {
                version,
                supported: CURRENT_VERSION,
            });
        }

        let message_type = MessageType::from_tag(reader.read_u16()?);
        let opaque = reader.read_u64()?;
        let sender_address = reader.read_str()?;
        let receiver_address = reader.read_str()?;
        let send_time_millis = reader.read_i64()?;
        let body = reader.remaining().to_vec();

        Ok(Message {
            version,
            message_type,
            opaque,
            context: MessageContext {
                sender_address,
                receiver_address,
                send_time_millis,
            },
            body,
        })
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message [type={}, opaque={}, bodyLen={}]",
            self.message_type,
            self.opaque,
            self.body.len()
        )
    }
}

fn put_str(buf: &mut Vec<u8>, value: &[u8]) -> SchedulerResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        SchedulerError::MalformedMessage(format!("地址过长: {} 字节", value.len()))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> SchedulerResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(SchedulerError::MalformedMessage(format!(
                "消息被截断: 需要 {} 字节, 剩余 {}",
                n,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> SchedulerResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn read_u8(&mut self) -> SchedulerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> SchedulerResult<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn read_u64(&mut self) -> SchedulerResult<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    fn read_i64(&mut self) -> SchedulerResult<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    fn read_str(&mut self) -> SchedulerResult<String> {
        let len = self.read_u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| SchedulerError::MalformedMessage(format!("地址不是有效的UTF-8: {e}")))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{HeartBeatMessage, MessageBody, TaskKillMessage};
    use crate::opaque::AtomicOpaqueGenerator;

    fn sample(message_type: MessageType, body: Vec<u8>) -> Message {
        let generator = AtomicOpaqueGenerator::starting_at(42);
        let mut context = MessageContext::new("10.0.0.1:5678", "10.0.0.2:1234");
        context.send_time_millis = 1_700_000_000_123;
        Message::request_with(&generator, message_type, context, body)
    }

    #[test]
    fn test_round_trip_field_for_field() {
        let original = sample(MessageType::TaskKill, b"{\"task_instance_id\":7}".to_vec());
        let decoded = Message::decode(&original.encode().unwrap()).unwrap();

        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.message_type, MessageType::TaskKill);
        assert_eq!(decoded.opaque, 42);
        assert_eq!(decoded.context.sender_address, "10.0.0.1:5678");
        assert_eq!(decoded.context.receiver_address, "10.0.0.2:1234");
        assert_eq!(decoded.context.send_time_millis, 1_700_000_000_123);
        assert_eq!(decoded.body, original.body);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_empty_body_and_addresses() {
        let original = Message::request_with(
            &AtomicOpaqueGenerator::new(),
            MessageType::Ping,
            MessageContext::default(),
            Vec::new(),
        );
        assert_eq!(Message::decode(&original.encode().unwrap()).unwrap(), original);
    }

    #[test]
    fn test_wire_header_layout() {
        let message = sample(MessageType::HeartBeat, vec![]);
        let bytes = message.encode().unwrap();

        assert_eq!(bytes[0], MAGIC);
        assert_eq!(bytes[1], CURRENT_VERSION);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 9);
        assert_eq!(u64::from_be_bytes(bytes[4..12].try_into().unwrap()), 42);
    }

    #[test]
    fn test_decode_rejects_wrong_magic() {
        let mut bytes = sample(MessageType::Ping, vec![]).encode().unwrap();
        bytes[0] = 0x00;
        assert!(matches!(
            Message::decode(&bytes),
            Err(SchedulerError::ProtocolMismatch { actual: 0x00, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_newer_version() {
        let mut bytes = sample(MessageType::Ping, vec![]).encode().unwrap();
        bytes[1] = CURRENT_VERSION + 1;
        assert!(matches!(
            Message::decode(&bytes),
            Err(SchedulerError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_is_malformed() {
        let bytes = sample(MessageType::Ping, vec![]).encode().unwrap();
        assert!(matches!(
            Message::decode(&bytes[..10]),
            Err(SchedulerError::MalformedMessage(_))
        ));
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_unknown_type_decodes_but_body_fails() {
        let message = sample(MessageType::Unknown(999), b"{}".to_vec());
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Unknown(999));
        assert!(!decoded.message_type.is_known());
        assert!(matches!(
            decoded.body_as::<TaskKillMessage>(),
            Err(SchedulerError::UnknownMessageType { tag: 999 })
        ));
    }

    #[test]
    fn test_body_as_checks_type() {
        let kill = TaskKillMessage {
            task_instance_id: 7,
            reason: None,
        };
        let message = kill
            .to_request(MessageContext::new("a", "b"))
            .unwrap();
        assert_eq!(message.body_as::<TaskKillMessage>().unwrap(), kill);
        assert!(message.body_as::<HeartBeatMessage>().is_err());
    }

    #[test]
    fn test_reply_echoes_opaque_and_swaps_addresses() {
        let request = sample(MessageType::TaskKill, vec![]);
        let reply = Message::reply_to(&request, MessageType::TaskKillResponse, vec![]);

        assert_eq!(reply.opaque, request.opaque);
        assert_eq!(reply.context.sender_address, "10.0.0.2:1234");
        assert_eq!(reply.context.receiver_address, "10.0.0.1:5678");
    }

    #[test]
    fn test_exchange_identity_ignores_body() {
        let a = sample(MessageType::TaskKill, b"one".to_vec());
        let mut b = a.clone();
        b.body = b"two".to_vec();
        assert!(a.is_same_exchange(&b));
        assert_eq!(a.exchange_key(), b.exchange_key());

        let mut c = a.clone();
        c.context.sender_address = "other".to_string();
        assert!(!a.is_same_exchange(&c));
    }

    #[test]
    fn test_type_tags_are_stable() {
        for tag in 1..=11u16 {
            let message_type = MessageType::from_tag(tag);
            assert!(message_type.is_known());
            assert_eq!(message_type.tag(), tag);
        }
        assert_eq!(MessageType::from_tag(0), MessageType::Unknown(0));
    }
}
