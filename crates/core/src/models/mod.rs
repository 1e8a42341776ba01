//! # 数据模型
//!
//! Master 与 Worker 共享的核心数据结构：
//!
//! - [`Schedule`] - 绑定到工作流定义的CRON触发配置
//! - [`TriggerEvent`] - 调度到点时产生的一次性触发事件
//! - [`TaskExecutionContext`] - Worker 接收的一次任务分发
//! - [`TaskExecutionStatus`] - 单调前进的任务执行状态
//!
//! ## 状态流转
//!
//! ```text
//! 调度:  OFFLINE ⇄ ONLINE
//! 任务:  SUBMITTED → DISPATCHED → RUNNING → SUCCESS | FAILURE | KILLED | TIMEOUT
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`，时区只在CRON计算时参与。

pub mod schedule;
pub mod task_execution;

pub use schedule::*;
pub use task_execution::*;
