use thiserror::Error;

use crate::models::TaskExecutionStatus;

/// 调度器错误类型定义
///
/// 按来源分组：协议错误只影响单条消息，关联错误会被记录并丢弃，
/// 连接错误会交给调用方区分"无应答"与"通道断开"。
#[derive(Debug, Error)]
pub enum SchedulerError {
    // ---- 协议错误 ----
    #[error("协议标识不匹配: 期望 {expected:#04x}, 实际 {actual:#04x}")]
    ProtocolMismatch { expected: u8, actual: u8 },

    #[error("不支持的协议版本: {version} (最高支持 {supported})")]
    UnsupportedVersion { version: u8, supported: u8 },

    #[error("未知的消息类型: {tag}")]
    UnknownMessageType { tag: u16 },

    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    #[error("消息帧过大: {size} 字节 (上限 {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ---- 关联错误 ----
    #[error("关联ID重复: {opaque}")]
    DuplicateCorrelationId { opaque: u64 },

    #[error("未匹配的关联ID: {opaque}")]
    UnmatchedCorrelationId { opaque: u64 },

    // ---- 连接错误 ----
    #[error("连接已断开: {0}")]
    ConnectionLost(String),

    #[error("等待应答超时: opaque={opaque}, timeout={timeout_ms}ms")]
    RequestTimeout { opaque: u64, timeout_ms: u64 },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("消息投递失败: {message_type} 重试 {attempts} 次后仍失败: {reason}")]
    DeliveryFailed {
        message_type: String,
        attempts: u32,
        reason: String,
    },

    // ---- 调度状态错误 ----
    #[error("调度 {id} 处于上线状态，必须先下线才能修改")]
    ScheduleMustBeOfflineToEdit { id: i64 },

    #[error("工作流定义 {code} 未上线，无法上线调度")]
    WorkflowDefinitionNotOnline { code: i64 },

    #[error("调度 {id} 处于上线状态，无法删除")]
    ScheduleOnlineCannotDelete { id: i64 },

    #[error("工作流定义 {code} 已存在调度")]
    ScheduleAlreadyExists { code: i64 },

    #[error("调度未找到: {id}")]
    ScheduleNotFound { id: i64 },

    #[error("工作流定义 {code} 没有调度")]
    WorkflowScheduleNotFound { code: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度配置: {0}")]
    InvalidSchedule(String),

    // ---- 任务错误 ----
    #[error("任务 {task_instance_id} 被拒绝: {reason}")]
    TaskRejected { task_instance_id: i64, reason: String },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("非法的任务状态转换: {from:?} -> {to:?}")]
    IllegalStateTransition {
        from: TaskExecutionStatus,
        to: TaskExecutionStatus,
    },

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("任务实例未找到: {id}")]
    TaskNotFound { id: i64 },

    // ---- 通用 ----
    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn rejected(task_instance_id: i64, reason: impl Into<String>) -> Self {
        Self::TaskRejected {
            task_instance_id,
            reason: reason.into(),
        }
    }

    /// 是否为连接层面的错误（通道断开、超时、网络异常）
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::RequestTimeout { .. } | Self::Network(_)
        )
    }

    /// 是否值得有限次重试
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }

    /// 是否为只影响单条消息的协议错误
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolMismatch { .. }
                | Self::UnsupportedVersion { .. }
                | Self::UnknownMessageType { .. }
                | Self::MalformedMessage(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::ConnectionLost(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
