use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_core::{Schedule, ScheduleFilter, SchedulerError, SchedulerResult};

/// 调度定义的持久化
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// 保存新调度，由仓库分配ID
    async fn create(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Schedule>>;

    async fn get_by_workflow_code(
        &self,
        workflow_definition_code: i64,
    ) -> SchedulerResult<Option<Schedule>>;

    /// 多个工作流定义的调度，按ID升序；没有调度的编码直接略过
    async fn get_by_workflow_codes(
        &self,
        workflow_definition_codes: &[i64],
    ) -> SchedulerResult<Vec<Schedule>>;

    async fn update(&self, schedule: &Schedule) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<bool>;

    /// 按条件筛选，不分页，按ID升序
    async fn list(&self, filter: &ScheduleFilter) -> SchedulerResult<Vec<Schedule>>;

    async fn get_online_schedules(&self) -> SchedulerResult<Vec<Schedule>>;

    async fn update_last_fire_time(&self, id: i64, fire_time: DateTime<Utc>)
        -> SchedulerResult<()>;
}

/// 内存实现
#[derive(Debug, Clone)]
pub struct InMemoryScheduleRepository {
    schedules: Arc<Mutex<HashMap<i64, Schedule>>>,
    next_id: Arc<Mutex<i64>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self {
            schedules: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// 直接放入已有调度（保留其ID），用于模拟重启后的持久化状态
    pub fn with_schedules(schedules: Vec<Schedule>) -> Self {
        let max_id = schedules.iter().map(|s| s.id).max().unwrap_or(0);
        let map = schedules.into_iter().map(|s| (s.id, s)).collect();
        Self {
            schedules: Arc::new(Mutex::new(map)),
            next_id: Arc::new(Mutex::new(max_id + 1)),
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Schedule>> {
        self.schedules.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryScheduleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn create(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let mut schedules = self.lock();
        let mut next_id = self.next_id.lock().unwrap_or_else(|p| p.into_inner());

        let mut created = schedule.clone();
        created.id = *next_id;
        *next_id += 1;

        schedules.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn get_by_workflow_code(
        &self,
        workflow_definition_code: i64,
    ) -> SchedulerResult<Option<Schedule>> {
        Ok(self
            .lock()
            .values()
            .find(|s| s.workflow_definition_code == workflow_definition_code)
            .cloned())
    }

    async fn get_by_workflow_codes(
        &self,
        workflow_definition_codes: &[i64],
    ) -> SchedulerResult<Vec<Schedule>> {
        let mut matched: Vec<Schedule> = self
            .lock()
            .values()
            .filter(|s| workflow_definition_codes.contains(&s.workflow_definition_code))
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.id);
        Ok(matched)
    }

    async fn update(&self, schedule: &Schedule) -> SchedulerResult<()> {
        let mut schedules = self.lock();
        match schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => Err(SchedulerError::ScheduleNotFound { id: schedule.id }),
        }
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn list(&self, filter: &ScheduleFilter) -> SchedulerResult<Vec<Schedule>> {
        let mut matched: Vec<Schedule> = self
            .lock()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.id);
        Ok(matched)
    }

    async fn get_online_schedules(&self) -> SchedulerResult<Vec<Schedule>> {
        let mut online: Vec<Schedule> = self
            .lock()
            .values()
            .filter(|s| s.is_online())
            .cloned()
            .collect();
        online.sort_by_key(|s| s.id);
        Ok(online)
    }

    async fn update_last_fire_time(
        &self,
        id: i64,
        fire_time: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut schedules = self.lock();
        let schedule = schedules
            .get_mut(&id)
            .ok_or(SchedulerError::ScheduleNotFound { id })?;
        schedule.last_fire_time = Some(fire_time);
        Ok(())
    }
}
