//! 调度系统公共基础：错误类型、配置、日志和共享数据模型。

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;

pub use config::{
    AppConfig, DispatcherConfig, MisfirePolicy, ObservabilityConfig, TransportConfig,
    WorkerConfig,
};
pub use errors::*;
pub use logging::{init_logging, init_logging_from_config};
pub use models::*;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
