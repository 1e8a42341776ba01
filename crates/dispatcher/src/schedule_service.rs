//! 调度触发引擎
//!
//! 每个调度有一把独立的异步锁：同一调度的触发与上下线串行执行，
//! 不同调度之间并发触发。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use scheduler_core::{
    DispatcherConfig, FailureStrategy, MisfirePolicy, PageInfo, ReleaseState, Schedule,
    ScheduleCreateRequest, ScheduleFilter, SchedulePreviewRequest, ScheduleUpdateRequest,
    SchedulerError, SchedulerResult, TriggerEvent,
};
use scheduler_remote::RetryPolicy;

use crate::cron_utils::{self, CronScheduler, DEFAULT_PREVIEW_COUNT};
use crate::ports::{Clock, WorkflowDefinitionLookup, WorkflowInstanceCreator};
use crate::repository::ScheduleRepository;

/// 已上线、正在参与触发的调度
struct ActiveSchedule {
    schedule: Schedule,
    cron: CronScheduler,
    next_fire_time: Option<DateTime<Utc>>,
}

type Slot = Arc<Mutex<Option<ActiveSchedule>>>;

/// 一次触发扫描的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// 成功创建工作流实例的触发数
    pub fired: usize,
    /// 其中属于停机补偿的触发数
    pub catch_up: usize,
    /// 按补偿策略丢弃的错过时间点
    pub skipped: usize,
    /// 重试用尽后仍失败的触发数
    pub failed: usize,
}

impl TickSummary {
    fn merge(&mut self, other: TickSummary) {
        self.fired += other.fired;
        self.catch_up += other.catch_up;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct ScheduleService {
    repository: Arc<dyn ScheduleRepository>,
    workflow_lookup: Arc<dyn WorkflowDefinitionLookup>,
    instance_creator: Arc<dyn WorkflowInstanceCreator>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    slots: RwLock<HashMap<i64, Slot>>,
}

impl ScheduleService {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        workflow_lookup: Arc<dyn WorkflowDefinitionLookup>,
        instance_creator: Arc<dyn WorkflowInstanceCreator>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repository,
            workflow_lookup,
            instance_creator,
            clock,
            config,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, id: i64) -> Slot {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
        {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    fn all_slots(&self) -> Vec<(i64, Slot)> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect()
    }

    async fn load(&self, id: i64) -> SchedulerResult<Schedule> {
        self.repository
            .get_by_id(id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound { id })
    }

    fn validate_definition(schedule: &Schedule) -> SchedulerResult<CronScheduler> {
        if schedule.start_time >= schedule.end_time {
            return Err(SchedulerError::InvalidSchedule(format!(
                "开始时间 {} 必须早于结束时间 {}",
                schedule.start_time, schedule.end_time
            )));
        }
        CronScheduler::for_schedule(schedule)
    }

    // ---- 定义管理 ----

    pub async fn create_schedule(&self, request: ScheduleCreateRequest) -> SchedulerResult<Schedule> {
        let code = request.workflow_definition_code;
        if self.workflow_lookup.release_state(code).await?.is_none() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "工作流定义 {code} 不存在"
            )));
        }
        if self.repository.get_by_workflow_code(code).await?.is_some() {
            return Err(SchedulerError::ScheduleAlreadyExists { code });
        }

        let now = self.clock.now();
        let schedule = Schedule {
            id: 0,
            project_code: request.project_code,
            workflow_definition_code: code,
            crontab: request.crontab,
            start_time: request.start_time,
            end_time: request.end_time,
            timezone_id: request.timezone_id,
            release_state: ReleaseState::Offline,
            failure_strategy: request.failure_strategy,
            warning_type: request.warning_type,
            warning_group_id: request.warning_group_id,
            workflow_instance_priority: request.workflow_instance_priority,
            worker_group: request.worker_group,
            tenant_code: request.tenant_code,
            environment_code: request.environment_code,
            last_fire_time: None,
            create_time: now,
            update_time: now,
        };
        Self::validate_definition(&schedule)?;

        let created = self.repository.create(&schedule).await?;
        info!(
            "创建调度 {}: 工作流定义={}, 表达式={}",
            created.id, created.workflow_definition_code, created.crontab
        );
        Ok(created)
    }

    pub async fn update_schedule(
        &self,
        id: i64,
        request: ScheduleUpdateRequest,
    ) -> SchedulerResult<Schedule> {
        let slot = self.slot(id);
        let _guard = slot.lock().await;

        let mut schedule = self.load(id).await?;
        if schedule.is_online() {
            return Err(SchedulerError::ScheduleMustBeOfflineToEdit { id });
        }

        request.apply_to(&mut schedule);
        Self::validate_definition(&schedule)?;
        schedule.update_time = self.clock.now();

        self.repository.update(&schedule).await?;
        info!("更新调度 {}", id);
        Ok(schedule)
    }

    /// 按工作流定义编码修改调度，同样要求调度处于下线状态
    pub async fn update_schedule_by_workflow_code(
        &self,
        code: i64,
        request: ScheduleUpdateRequest,
    ) -> SchedulerResult<Schedule> {
        let schedule = self
            .repository
            .get_by_workflow_code(code)
            .await?
            .ok_or(SchedulerError::WorkflowScheduleNotFound { code })?;
        self.update_schedule(schedule.id, request).await
    }

    pub async fn delete_schedule(&self, id: i64) -> SchedulerResult<()> {
        let slot = self.slot(id);
        {
            let _guard = slot.lock().await;
            let schedule = self.load(id).await?;
            if schedule.is_online() {
                return Err(SchedulerError::ScheduleOnlineCannotDelete { id });
            }
            self.repository.delete(id).await?;
        }

        self.slots
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        info!("删除调度 {}", id);
        Ok(())
    }

    pub async fn get_schedule(&self, id: i64) -> SchedulerResult<Schedule> {
        self.load(id).await
    }

    pub async fn schedules_by_workflow_codes(&self, codes: &[i64]) -> SchedulerResult<Vec<Schedule>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        self.repository.get_by_workflow_codes(codes).await
    }

    /// 分页查询，页码从1开始
    pub async fn filter_schedules(&self, filter: &ScheduleFilter) -> SchedulerResult<PageInfo<Schedule>> {
        let page_no = filter.page_no.max(1);
        let page_size = filter.page_size.max(1);
        let matched = self.repository.list(filter).await?;

        Ok(PageInfo {
            total: matched.len(),
            page_no,
            page_size,
            items: matched
                .into_iter()
                .skip((page_no - 1) * page_size)
                .take(page_size)
                .collect(),
        })
    }

    // ---- 上下线 ----

    /// 上线调度；已上线时直接返回
    pub async fn online(&self, id: i64) -> SchedulerResult<Schedule> {
        let slot = self.slot(id);
        let mut active = slot.lock().await;

        let mut schedule = self.load(id).await?;
        if schedule.is_online() {
            if active.is_none() {
                *active = Some(self.activate(schedule.clone())?);
            }
            debug!("调度 {} 已处于上线状态", id);
            return Ok(schedule);
        }

        let code = schedule.workflow_definition_code;
        if self.workflow_lookup.release_state(code).await? != Some(ReleaseState::Online) {
            return Err(SchedulerError::WorkflowDefinitionNotOnline { code });
        }

        let now = self.clock.now();
        schedule.release_state = ReleaseState::Online;
        // 从上线时刻起算，下线期间的时间点不补发
        schedule.last_fire_time = Some(now);
        schedule.update_time = now;

        let registered = self.activate(schedule.clone())?;
        self.repository.update(&schedule).await?;
        info!(
            "调度 {} 已上线，下次触发时间: {:?}",
            id, registered.next_fire_time
        );
        *active = Some(registered);
        Ok(schedule)
    }

    /// 下线调度；已下线时直接返回。不影响工作流定义本身
    pub async fn offline(&self, id: i64) -> SchedulerResult<Schedule> {
        let slot = self.slot(id);
        let mut active = slot.lock().await;

        let mut schedule = self.load(id).await?;
        if !schedule.is_online() {
            *active = None;
            debug!("调度 {} 已处于下线状态", id);
            return Ok(schedule);
        }

        schedule.release_state = ReleaseState::Offline;
        schedule.update_time = self.clock.now();
        self.repository.update(&schedule).await?;
        *active = None;

        info!("调度 {} 已下线", id);
        Ok(schedule)
    }

    /// 工作流定义没有调度时返回 `None`
    pub async fn online_by_workflow_code(&self, code: i64) -> SchedulerResult<Option<Schedule>> {
        match self.repository.get_by_workflow_code(code).await? {
            Some(schedule) => self.online(schedule.id).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn offline_by_workflow_code(&self, code: i64) -> SchedulerResult<Option<Schedule>> {
        match self.repository.get_by_workflow_code(code).await? {
            Some(schedule) => self.offline(schedule.id).await.map(Some),
            None => Ok(None),
        }
    }

    fn activate(&self, schedule: Schedule) -> SchedulerResult<ActiveSchedule> {
        let cron = CronScheduler::for_schedule(&schedule)?;
        let baseline = schedule.last_fire_time.unwrap_or_else(|| self.clock.now());
        let next_fire_time = cron.next_execution_time(baseline);
        Ok(ActiveSchedule {
            schedule,
            cron,
            next_fire_time,
        })
    }

    // ---- 预览 ----

    /// 从当前时间起预览接下来的触发时间，按请求的时区和有效期计算
    pub fn preview_next_fire_times(
        &self,
        request: &SchedulePreviewRequest,
    ) -> SchedulerResult<Vec<DateTime<Utc>>> {
        if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
            if start >= end {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "开始时间 {start} 必须早于结束时间 {end}"
                )));
            }
        }
        cron_utils::preview_next_fire_times(
            &request.crontab,
            request.start_time,
            request.end_time,
            &request.timezone_id,
            self.clock.now(),
            request.count.unwrap_or(DEFAULT_PREVIEW_COUNT),
        )
    }

    pub async fn next_fire_time(&self, id: i64) -> Option<DateTime<Utc>> {
        let slot = self.slots.read().unwrap_or_else(|p| p.into_inner()).get(&id).cloned()?;
        let active = slot.lock().await;
        active.as_ref().and_then(|a| a.next_fire_time)
    }

    /// 参与触发的调度数
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.all_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    // ---- 触发 ----

    /// 重启后加载所有已上线的调度，随后的扫描按补偿策略处理停机期间错过的时间点
    pub async fn recover(&self, now: DateTime<Utc>) -> SchedulerResult<TickSummary> {
        let online = self.repository.get_online_schedules().await?;
        let mut recovered = 0;

        for mut schedule in online {
            let slot = self.slot(schedule.id);
            let mut active = slot.lock().await;
            if schedule.last_fire_time.is_none() {
                schedule.last_fire_time = Some(now);
            }
            match self.activate(schedule) {
                Ok(registered) => {
                    *active = Some(registered);
                    recovered += 1;
                }
                Err(e) => error!("恢复调度失败: {}", e),
            }
        }

        info!("恢复了 {} 个已上线的调度", recovered);
        Ok(self.tick(now).await)
    }

    /// 一次触发扫描
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let results = join_all(
            self.all_slots()
                .into_iter()
                .map(|(id, slot)| self.fire_schedule(id, slot, now)),
        )
        .await;

        let mut summary = TickSummary::default();
        for result in results {
            summary.merge(result);
        }
        if summary.fired > 0 || summary.failed > 0 {
            debug!("本次扫描: {:?}", summary);
        }
        summary
    }

    async fn fire_schedule(&self, id: i64, slot: Slot, now: DateTime<Utc>) -> TickSummary {
        let mut guard = slot.lock().await;
        // 在锁外被下线的调度不再触发
        let Some(active) = guard.as_mut() else {
            return TickSummary::default();
        };

        let baseline = active.schedule.last_fire_time.unwrap_or(now);
        let (missed, on_time, skipped, latest_due) = self.collect_due_times(active, baseline, now);

        let mut summary = TickSummary {
            skipped,
            ..Default::default()
        };
        if skipped > 0 {
            warn!(
                "调度 {} 按 {:?} 策略丢弃了 {} 个错过的触发时间",
                id, self.config.misfire_policy, skipped
            );
            counter!("schedule_misfires_dropped_total").increment(skipped as u64);
        }

        let mut persisted = None;
        let due = missed
            .into_iter()
            .map(|t| (t, true))
            .chain(on_time.into_iter().map(|t| (t, false)));
        for (schedule_time, catch_up) in due {
            let event = active
                .schedule
                .trigger_event(schedule_time, self.clock.now(), catch_up);
            if self.emit(&event).await {
                summary.fired += 1;
                if catch_up {
                    summary.catch_up += 1;
                }
            } else {
                summary.failed += 1;
            }
            self.advance(active, schedule_time).await;
            persisted = Some(schedule_time);
        }

        if let Some(latest) = latest_due {
            if persisted != Some(latest) {
                self.advance(active, latest).await;
            }
        }

        let from = active.schedule.last_fire_time.unwrap_or(now).max(now);
        active.next_fire_time = active.cron.next_execution_time(from);
        summary
    }

    /// 按补偿策略划分 `(baseline, now]` 内的触发时间
    fn collect_due_times(
        &self,
        active: &ActiveSchedule,
        baseline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (VecDeque<DateTime<Utc>>, Vec<DateTime<Utc>>, usize, Option<DateTime<Utc>>) {
        let threshold = now - self.config.misfire_threshold();
        let cap = self.config.max_catch_up_fires;

        let mut missed = VecDeque::new();
        let mut on_time = Vec::new();
        let mut skipped = 0;
        let mut latest_due = None;

        for t in active.cron.iter_after(baseline).take_while(|t| *t <= now) {
            latest_due = Some(t);
            if t >= threshold {
                on_time.push(t);
                continue;
            }
            match self.config.misfire_policy {
                MisfirePolicy::FireAll => {
                    if cap == 0 {
                        skipped += 1;
                        continue;
                    }
                    // 超出上限时丢弃最早的
                    if missed.len() == cap {
                        missed.pop_front();
                        skipped += 1;
                    }
                    missed.push_back(t);
                }
                MisfirePolicy::FireLatest => {
                    if missed.pop_back().is_some() {
                        skipped += 1;
                    }
                    missed.push_back(t);
                }
                MisfirePolicy::Skip => skipped += 1,
            }
        }

        (missed, on_time, skipped, latest_due)
    }

    async fn advance(&self, active: &mut ActiveSchedule, fire_time: DateTime<Utc>) {
        active.schedule.last_fire_time = Some(fire_time);
        if let Err(e) = self
            .repository
            .update_last_fire_time(active.schedule.id, fire_time)
            .await
        {
            error!(
                "保存调度 {} 的触发进度失败: {}",
                active.schedule.id, e
            );
        }
    }

    /// 交给工作流实例创建能力，失败按策略重试；最终失败时记录并返回 false
    async fn emit(&self, event: &TriggerEvent) -> bool {
        let attempts = match event.failure_strategy {
            FailureStrategy::End => 1,
            FailureStrategy::Continue => self.config.trigger_retry_attempts.max(1),
        };
        let backoff = RetryPolicy::new(
            attempts,
            Duration::from_millis(self.config.trigger_retry_delay_ms),
            Duration::from_millis(self.config.trigger_retry_delay_ms.saturating_mul(8)),
        );

        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay_for(attempt - 1)).await;
            }
            match self.instance_creator.create_workflow_instance(event).await {
                Ok(instance_id) => {
                    counter!("schedule_fires_total").increment(1);
                    if event.catch_up {
                        counter!("schedule_catch_up_fires_total").increment(1);
                    }
                    info!(
                        "调度 {} 触发: 逻辑时间={}, 工作流实例={}{}",
                        event.schedule_id,
                        event.schedule_time,
                        instance_id,
                        if event.catch_up { " (补偿)" } else { "" }
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "调度 {} 创建工作流实例失败 (第 {}/{} 次): {}",
                        event.schedule_id,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| SchedulerError::Internal("工作流实例创建失败".to_string()));
        counter!("schedule_trigger_failures_total").increment(1);
        error!(
            "调度 {} 在逻辑时间 {} 的触发最终失败: {}",
            event.schedule_id, event.schedule_time, error
        );
        self.instance_creator.on_trigger_failed(event, &error).await;
        false
    }

    /// 按配置的间隔持续扫描，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.schedule_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "调度触发引擎启动，扫描间隔 {:?}",
            self.config.schedule_interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(self.clock.now()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("调度触发引擎收到关闭信号");
                    break;
                }
            }
        }
    }
}
