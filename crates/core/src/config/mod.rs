//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML配置文件 → `SCHEDULER_` 前缀的环境变量。
//!
//! ```toml
//! [dispatcher]
//! listen_address = "0.0.0.0:5678"
//! misfire_policy = "fire_all"
//!
//! [worker]
//! worker_id = "worker-001"
//! master_address = "127.0.0.1:5678"
//! worker_groups = ["default"]
//! ```
//!
//! 环境变量使用双下划线分隔层级，例如
//! `SCHEDULER_WORKER__MAX_CONCURRENT_TASKS=32`。

pub mod models;

pub use models::*;
