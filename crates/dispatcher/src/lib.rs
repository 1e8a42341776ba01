//! Master 侧：调度触发引擎、任务分发与生命周期上报处理。

pub mod cron_utils;
pub mod ports;
pub mod repository;
pub mod schedule_service;
pub mod task_dispatcher;
pub mod task_event;

pub use cron_utils::{preview_next_fire_times, CronScheduler};
pub use ports::*;
pub use repository::{InMemoryScheduleRepository, ScheduleRepository};
pub use schedule_service::{ScheduleService, TickSummary};
pub use task_dispatcher::TaskDispatcher;
pub use task_event::{HeartBeatHandler, TaskEventHandler, TaskEventTracker, TrackedTask};
