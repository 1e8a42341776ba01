//! 调度引擎依赖的外部能力

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{error, info};

use scheduler_core::{ReleaseState, SchedulerError, SchedulerResult, TriggerEvent};

/// 工作流定义查询，只关心发布状态
#[async_trait]
pub trait WorkflowDefinitionLookup: Send + Sync {
    /// 未知的工作流定义返回 `None`
    async fn release_state(&self, workflow_definition_code: i64)
        -> SchedulerResult<Option<ReleaseState>>;
}

/// 工作流实例创建能力，触发事件的唯一消费者
#[async_trait]
pub trait WorkflowInstanceCreator: Send + Sync {
    /// 为触发事件创建工作流实例，返回实例ID
    async fn create_workflow_instance(&self, event: &TriggerEvent) -> SchedulerResult<i64>;

    /// 重试用尽后记录失败，保证触发事件不会被静默丢弃
    async fn on_trigger_failed(&self, event: &TriggerEvent, error: &SchedulerError);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动拨动的时钟
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// 内存中的工作流定义表
#[derive(Debug, Default)]
pub struct InMemoryWorkflowDefinitionLookup {
    definitions: RwLock<HashMap<i64, ReleaseState>>,
}

impl InMemoryWorkflowDefinitionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_release_state(&self, workflow_definition_code: i64, state: ReleaseState) {
        self.definitions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(workflow_definition_code, state);
    }
}

#[async_trait]
impl WorkflowDefinitionLookup for InMemoryWorkflowDefinitionLookup {
    async fn release_state(
        &self,
        workflow_definition_code: i64,
    ) -> SchedulerResult<Option<ReleaseState>> {
        Ok(self
            .definitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&workflow_definition_code)
            .copied())
    }
}

/// 只记录日志和指标、不保留任何事件的实例创建器
///
/// 没有接入外部工作流系统时使用，长时间运行内存不会增长。
#[derive(Debug, Default)]
pub struct LoggingInstanceCreator {
    next_instance_id: AtomicI64,
}

impl LoggingInstanceCreator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowInstanceCreator for LoggingInstanceCreator {
    async fn create_workflow_instance(&self, event: &TriggerEvent) -> SchedulerResult<i64> {
        let instance_id = self.next_instance_id.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("workflow_instances_created_total", "catch_up" => event.catch_up.to_string())
            .increment(1);
        info!(
            "调度 {} 触发工作流定义 {}: 计划时间 {}, 实例 {}",
            event.schedule_id,
            event.workflow_definition_code,
            event.schedule_time.format("%Y-%m-%d %H:%M:%S UTC"),
            instance_id
        );
        Ok(instance_id)
    }

    async fn on_trigger_failed(&self, event: &TriggerEvent, error: &SchedulerError) {
        counter!("workflow_instance_create_failures_total").increment(1);
        error!(
            "调度 {} 在 {} 的触发最终失败: {}",
            event.schedule_id,
            event.schedule_time.format("%Y-%m-%d %H:%M:%S UTC"),
            error
        );
    }
}

/// 把触发事件记录在内存里的实例创建器，测试中检查触发结果
#[derive(Debug, Default)]
pub struct RecordingInstanceCreator {
    next_instance_id: Mutex<i64>,
    created: Mutex<Vec<TriggerEvent>>,
    failed: Mutex<Vec<(TriggerEvent, String)>>,
    /// 接下来需要失败的调用次数
    fail_next: Mutex<u32>,
}

impl RecordingInstanceCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: u32) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = times;
    }

    pub fn created(&self) -> Vec<TriggerEvent> {
        self.created.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn failed(&self) -> Vec<(TriggerEvent, String)> {
        self.failed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl WorkflowInstanceCreator for RecordingInstanceCreator {
    async fn create_workflow_instance(&self, event: &TriggerEvent) -> SchedulerResult<i64> {
        {
            let mut fail_next = self.fail_next.lock().unwrap_or_else(|p| p.into_inner());
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(SchedulerError::Internal("工作流实例创建失败".to_string()));
            }
        }

        let mut next = self.next_instance_id.lock().unwrap_or_else(|p| p.into_inner());
        *next += 1;
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(*next)
    }

    async fn on_trigger_failed(&self, event: &TriggerEvent, error: &SchedulerError) {
        self.failed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((event.clone(), error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler_core::{FailureStrategy, Priority, WarningType};

    fn event(schedule_id: i64) -> TriggerEvent {
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        TriggerEvent {
            schedule_id,
            project_code: 1,
            workflow_definition_code: 1001,
            schedule_time: time,
            fire_time: time,
            priority: Priority::default(),
            worker_group: "default".into(),
            tenant_code: "default".into(),
            environment_code: None,
            failure_strategy: FailureStrategy::default(),
            warning_type: WarningType::default(),
            warning_group_id: 0,
            catch_up: false,
        }
    }

    #[tokio::test]
    async fn test_logging_creator_assigns_increasing_ids() {
        let creator = LoggingInstanceCreator::new();
        assert_eq!(creator.create_workflow_instance(&event(1)).await.unwrap(), 1);
        assert_eq!(creator.create_workflow_instance(&event(2)).await.unwrap(), 2);

        creator
            .on_trigger_failed(&event(3), &SchedulerError::Internal("boom".into()))
            .await;
        assert_eq!(creator.create_workflow_instance(&event(4)).await.unwrap(), 3);
    }
}
