use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Notify;

use scheduler_core::{
    DispatcherConfig, FailureStrategy, MisfirePolicy, ReleaseState, Schedule,
    ScheduleCreateRequest, ScheduleFilter, SchedulePreviewRequest, ScheduleUpdateRequest,
    SchedulerError, SchedulerResult, TriggerEvent,
};
use scheduler_dispatcher::{
    InMemoryScheduleRepository, InMemoryWorkflowDefinitionLookup, ManualClock,
    RecordingInstanceCreator, ScheduleRepository, ScheduleService, WorkflowInstanceCreator,
};

const WORKFLOW: i64 = 1001;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        trigger_retry_attempts: 3,
        trigger_retry_delay_ms: 1,
        ..Default::default()
    }
}

struct Fixture {
    service: ScheduleService,
    repository: Arc<InMemoryScheduleRepository>,
    lookup: Arc<InMemoryWorkflowDefinitionLookup>,
    creator: Arc<RecordingInstanceCreator>,
    clock: ManualClock,
}

fn fixture_with(config: DispatcherConfig, repository: InMemoryScheduleRepository) -> Fixture {
    let repository = Arc::new(repository);
    let lookup = Arc::new(InMemoryWorkflowDefinitionLookup::new());
    lookup.set_release_state(WORKFLOW, ReleaseState::Online);
    let creator = Arc::new(RecordingInstanceCreator::new());
    let clock = ManualClock::new(at(10, 15));

    let service = ScheduleService::new(
        repository.clone(),
        lookup.clone(),
        creator.clone(),
        Arc::new(clock.clone()),
        config,
    );
    Fixture {
        service,
        repository,
        lookup,
        creator,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with(fast_config(), InMemoryScheduleRepository::new())
}

fn hourly_request() -> ScheduleCreateRequest {
    ScheduleCreateRequest::new(
        1,
        WORKFLOW,
        "0 0 * * * ?",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn test_create_starts_offline_and_validates() {
    let f = fixture();
    let schedule = f.service.create_schedule(hourly_request()).await.unwrap();
    assert_eq!(schedule.release_state, ReleaseState::Offline);
    assert!(schedule.id > 0);

    // 同一工作流定义只能有一个调度
    assert!(matches!(
        f.service.create_schedule(hourly_request()).await,
        Err(SchedulerError::ScheduleAlreadyExists { code: WORKFLOW })
    ));

    let mut bad_cron = hourly_request();
    bad_cron.workflow_definition_code = 2002;
    f.lookup.set_release_state(2002, ReleaseState::Online);
    bad_cron.crontab = "every hour".into();
    assert!(matches!(
        f.service.create_schedule(bad_cron).await,
        Err(SchedulerError::InvalidCron { .. })
    ));

    let mut bad_range = hourly_request();
    bad_range.workflow_definition_code = 2002;
    bad_range.end_time = bad_range.start_time;
    assert!(matches!(
        f.service.create_schedule(bad_range).await,
        Err(SchedulerError::InvalidSchedule(_))
    ));
}

#[tokio::test]
async fn test_online_is_idempotent() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;

    let first = f.service.online(id).await.unwrap();
    let second = f.service.online(id).await.unwrap();
    assert_eq!(first.release_state, ReleaseState::Online);
    assert_eq!(second.release_state, ReleaseState::Online);
    assert_eq!(f.service.active_count().await, 1);
    assert_eq!(f.service.next_fire_time(id).await, Some(at(11, 0)));
}

#[tokio::test]
async fn test_online_requires_online_workflow_definition() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.lookup.set_release_state(WORKFLOW, ReleaseState::Offline);

    assert!(matches!(
        f.service.online(id).await,
        Err(SchedulerError::WorkflowDefinitionNotOnline { code: WORKFLOW })
    ));
    let schedule = f.service.get_schedule(id).await.unwrap();
    assert_eq!(schedule.release_state, ReleaseState::Offline);
    assert_eq!(f.service.active_count().await, 0);
}

#[tokio::test]
async fn test_edit_and_delete_require_offline() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.service.online(id).await.unwrap();

    let update = ScheduleUpdateRequest {
        crontab: Some("0 30 * * * ?".into()),
        ..Default::default()
    };
    assert!(matches!(
        f.service.update_schedule(id, update.clone()).await,
        Err(SchedulerError::ScheduleMustBeOfflineToEdit { .. })
    ));
    assert!(matches!(
        f.service.delete_schedule(id).await,
        Err(SchedulerError::ScheduleOnlineCannotDelete { .. })
    ));

    f.service.offline(id).await.unwrap();
    let updated = f.service.update_schedule(id, update).await.unwrap();
    assert_eq!(updated.crontab, "0 30 * * * ?");

    f.service.delete_schedule(id).await.unwrap();
    assert!(matches!(
        f.service.get_schedule(id).await,
        Err(SchedulerError::ScheduleNotFound { .. })
    ));
}

#[tokio::test]
async fn test_offline_is_idempotent_and_keeps_workflow_definition() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.service.offline(id).await.unwrap();
    f.service.online(id).await.unwrap();
    f.service.offline(id).await.unwrap();
    f.service.offline(id).await.unwrap();

    use scheduler_dispatcher::WorkflowDefinitionLookup;
    assert_eq!(
        f.lookup.release_state(WORKFLOW).await.unwrap(),
        Some(ReleaseState::Online)
    );
}

#[tokio::test]
async fn test_by_workflow_code_operations() {
    let f = fixture();
    assert!(f.service.online_by_workflow_code(WORKFLOW).await.unwrap().is_none());

    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    let online = f.service.online_by_workflow_code(WORKFLOW).await.unwrap().unwrap();
    assert_eq!(online.id, id);
    assert!(online.is_online());

    let offline = f.service.offline_by_workflow_code(WORKFLOW).await.unwrap().unwrap();
    assert!(!offline.is_online());
}

#[tokio::test]
async fn test_filter_schedules_with_paging() {
    let f = fixture();
    for code in 1..=5 {
        f.lookup.set_release_state(code, ReleaseState::Online);
        let mut request = hourly_request();
        request.workflow_definition_code = code;
        request.project_code = if code % 2 == 0 { 2 } else { 1 };
        f.service.create_schedule(request).await.unwrap();
    }

    let page = f
        .service
        .filter_schedules(&ScheduleFilter {
            project_code: Some(1),
            page_no: 1,
            page_size: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);

    let page = f
        .service
        .filter_schedules(&ScheduleFilter {
            project_code: Some(1),
            page_no: 2,
            page_size: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);

    let outside = f
        .service
        .filter_schedules(&ScheduleFilter {
            start_time: Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outside.total, 0);
}

#[tokio::test]
async fn test_preview_uses_clock() {
    let f = fixture();
    let request = SchedulePreviewRequest {
        count: Some(3),
        ..SchedulePreviewRequest::new("0 0 * * * ?")
    };
    let times = f.service.preview_next_fire_times(&request).unwrap();
    assert_eq!(times, vec![at(11, 0), at(12, 0), at(13, 0)]);
    assert_eq!(
        f.service
            .preview_next_fire_times(&SchedulePreviewRequest::new("0 0 * * * ?"))
            .unwrap()
            .len(),
        5
    );
}

#[tokio::test]
async fn test_preview_in_timezone_with_bounds() {
    let f = fixture();
    // 上海时间每天 09:00 即 UTC 01:00
    let request = SchedulePreviewRequest {
        timezone_id: "Asia/Shanghai".into(),
        count: Some(3),
        ..SchedulePreviewRequest::new("0 0 9 * * ?")
    };
    let day = |d: u32| Utc.with_ymd_and_hms(2024, 1, d, 1, 0, 0).unwrap();
    assert_eq!(
        f.service.preview_next_fire_times(&request).unwrap(),
        vec![day(2), day(3), day(4)]
    );

    let bounded = SchedulePreviewRequest {
        start_time: Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()),
        end_time: Some(Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap()),
        ..request.clone()
    };
    assert_eq!(
        f.service.preview_next_fire_times(&bounded).unwrap(),
        vec![day(5), day(6)]
    );

    let inverted = SchedulePreviewRequest {
        start_time: bounded.end_time,
        end_time: bounded.start_time,
        ..request
    };
    assert!(matches!(
        f.service.preview_next_fire_times(&inverted),
        Err(SchedulerError::InvalidSchedule(_))
    ));
}

#[tokio::test]
async fn test_schedule_in_named_timezone_fires_at_local_time() {
    let f = fixture();
    let mut request = hourly_request();
    request.crontab = "0 0 9 * * ?".into();
    request.timezone_id = "Asia/Shanghai".into();

    let schedule = f.service.create_schedule(request).await.unwrap();
    assert_eq!(schedule.timezone_id, "Asia/Shanghai");
    f.service.online(schedule.id).await.unwrap();

    let next = Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap();
    assert_eq!(f.service.next_fire_time(schedule.id).await, Some(next));
    assert_eq!(f.service.tick(next).await.fired, 1);
}

#[tokio::test]
async fn test_update_by_workflow_code_requires_offline() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;

    let update = ScheduleUpdateRequest {
        crontab: Some("0 30 * * * ?".into()),
        ..Default::default()
    };
    let updated = f
        .service
        .update_schedule_by_workflow_code(WORKFLOW, update.clone())
        .await
        .unwrap();
    assert_eq!(updated.id, id);
    assert_eq!(updated.crontab, "0 30 * * * ?");

    f.service.online(id).await.unwrap();
    assert!(matches!(
        f.service
            .update_schedule_by_workflow_code(WORKFLOW, update.clone())
            .await,
        Err(SchedulerError::ScheduleMustBeOfflineToEdit { id: got }) if got == id
    ));
    assert!(matches!(
        f.service.update_schedule_by_workflow_code(4040, update).await,
        Err(SchedulerError::WorkflowScheduleNotFound { code: 4040 })
    ));
}

#[tokio::test]
async fn test_schedules_by_workflow_codes() {
    let f = fixture();
    f.lookup.set_release_state(2002, ReleaseState::Online);
    f.lookup.set_release_state(3003, ReleaseState::Online);
    for code in [WORKFLOW, 2002, 3003] {
        let mut request = hourly_request();
        request.workflow_definition_code = code;
        f.service.create_schedule(request).await.unwrap();
    }

    let found = f
        .service
        .schedules_by_workflow_codes(&[3003, WORKFLOW, 9999])
        .await
        .unwrap();
    let codes: Vec<i64> = found.iter().map(|s| s.workflow_definition_code).collect();
    assert_eq!(codes, vec![WORKFLOW, 3003]);
    assert!(f
        .service
        .schedules_by_workflow_codes(&[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_tick_fires_each_time_exactly_once() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.service.online(id).await.unwrap();

    assert_eq!(f.service.tick(at(10, 59)).await.fired, 0);
    assert_eq!(f.service.tick(at(11, 0)).await.fired, 1);
    assert_eq!(f.service.tick(at(11, 0)).await.fired, 0);
    assert_eq!(f.service.tick(at(11, 30)).await.fired, 0);

    let created = f.creator.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].schedule_time, at(11, 0));
    assert!(!created[0].catch_up);
    assert_eq!(created[0].schedule_id, id);

    let stored = f.repository.get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.last_fire_time, Some(at(11, 0)));
    assert_eq!(f.service.next_fire_time(id).await, Some(at(12, 0)));
}

#[tokio::test]
async fn test_offline_schedule_does_not_fire() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.service.online(id).await.unwrap();
    f.service.offline(id).await.unwrap();

    assert_eq!(f.service.tick(at(12, 0)).await.fired, 0);
    assert!(f.creator.created().is_empty());
}

/// 持久化状态：上次触发在 10:00，随后停机到 15:10
fn downtime_fixture(policy: MisfirePolicy, max_catch_up_fires: usize) -> Fixture {
    let now = at(10, 15);
    let schedule = Schedule {
        id: 7,
        project_code: 1,
        workflow_definition_code: WORKFLOW,
        crontab: "0 0 * * * ?".into(),
        start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        timezone_id: "UTC".into(),
        release_state: ReleaseState::Online,
        failure_strategy: FailureStrategy::Continue,
        warning_type: Default::default(),
        warning_group_id: 0,
        workflow_instance_priority: Default::default(),
        worker_group: "default".into(),
        tenant_code: "default".into(),
        environment_code: None,
        last_fire_time: Some(at(10, 0)),
        create_time: now,
        update_time: now,
    };
    let config = DispatcherConfig {
        misfire_policy: policy,
        max_catch_up_fires,
        misfire_threshold_seconds: 60,
        ..fast_config()
    };
    fixture_with(config, InMemoryScheduleRepository::with_schedules(vec![schedule]))
}

#[tokio::test]
async fn test_recover_fire_all_emits_backlog_in_order() {
    let f = downtime_fixture(MisfirePolicy::FireAll, 100);
    let summary = f.service.recover(at(15, 10)).await.unwrap();

    assert_eq!(summary.fired, 5);
    assert_eq!(summary.catch_up, 5);
    let times: Vec<_> = f.creator.created().iter().map(|e| e.schedule_time).collect();
    assert_eq!(times, vec![at(11, 0), at(12, 0), at(13, 0), at(14, 0), at(15, 0)]);
    assert!(f.creator.created().iter().all(|e| e.catch_up));

    // 补偿之后不重复触发
    assert_eq!(f.service.tick(at(15, 30)).await.fired, 0);
    assert_eq!(f.service.tick(at(16, 0)).await.fired, 1);
}

#[tokio::test]
async fn test_recover_fire_all_caps_backlog() {
    let f = downtime_fixture(MisfirePolicy::FireAll, 2);
    let summary = f.service.recover(at(15, 10)).await.unwrap();

    assert_eq!(summary.fired, 2);
    assert_eq!(summary.skipped, 3);
    let times: Vec<_> = f.creator.created().iter().map(|e| e.schedule_time).collect();
    assert_eq!(times, vec![at(14, 0), at(15, 0)]);
}

#[tokio::test]
async fn test_recover_fire_latest_emits_one() {
    let f = downtime_fixture(MisfirePolicy::FireLatest, 100);
    let summary = f.service.recover(at(15, 10)).await.unwrap();

    assert_eq!(summary.fired, 1);
    assert_eq!(summary.skipped, 4);
    let created = f.creator.created();
    assert_eq!(created[0].schedule_time, at(15, 0));
    assert!(created[0].catch_up);
}

#[tokio::test]
async fn test_recover_skip_waits_for_next_future_time() {
    let f = downtime_fixture(MisfirePolicy::Skip, 100);
    let summary = f.service.recover(at(15, 10)).await.unwrap();

    assert_eq!(summary.fired, 0);
    assert_eq!(summary.skipped, 5);
    assert_eq!(f.service.next_fire_time(7).await, Some(at(16, 0)));
    let stored = f.repository.get_by_id(7).await.unwrap().unwrap();
    assert_eq!(stored.last_fire_time, Some(at(15, 0)));

    assert_eq!(f.service.tick(at(16, 0)).await.fired, 1);
}

#[tokio::test]
async fn test_on_time_fire_is_not_catch_up() {
    // 15:00 在阈值内，属于准点触发
    let f = downtime_fixture(MisfirePolicy::Skip, 100);
    f.service.recover(at(15, 0) + Duration::seconds(30)).await.unwrap();

    let created = f.creator.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].schedule_time, at(15, 0));
    assert!(!created[0].catch_up);
}

#[tokio::test]
async fn test_trigger_failure_retried_then_recorded() {
    let f = fixture();
    let id = f.service.create_schedule(hourly_request()).await.unwrap().id;
    f.service.online(id).await.unwrap();

    // 前两次失败，第三次成功
    f.creator.fail_next(2);
    let summary = f.service.tick(at(11, 0)).await;
    assert_eq!(summary.fired, 1);
    assert!(f.creator.failed().is_empty());

    // 全部失败时交给 on_trigger_failed，且不会在下次扫描重复触发
    f.creator.fail_next(10);
    let summary = f.service.tick(at(12, 0)).await;
    assert_eq!(summary.failed, 1);
    let failed = f.creator.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.schedule_time, at(12, 0));

    f.creator.fail_next(0);
    assert_eq!(f.service.tick(at(12, 0)).await.fired, 0);
}

#[tokio::test]
async fn test_end_failure_strategy_tries_once() {
    let f = fixture();
    let mut request = hourly_request();
    request.failure_strategy = FailureStrategy::End;
    let id = f.service.create_schedule(request).await.unwrap().id;
    f.service.online(id).await.unwrap();

    f.creator.fail_next(1);
    let summary = f.service.tick(at(11, 0)).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(f.creator.failed().len(), 1);
}

/// 第一次创建实例时阻塞，直到测试放行
struct BlockingCreator {
    entered: Notify,
    release: Notify,
    created: AtomicUsize,
}

#[async_trait]
impl WorkflowInstanceCreator for BlockingCreator {
    async fn create_workflow_instance(&self, _event: &TriggerEvent) -> SchedulerResult<i64> {
        if self.created.load(Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(self.created.fetch_add(1, Ordering::SeqCst) as i64 + 1)
    }

    async fn on_trigger_failed(&self, _event: &TriggerEvent, _error: &SchedulerError) {}
}

#[tokio::test]
async fn test_offline_waits_for_in_flight_fire() {
    let repository = Arc::new(InMemoryScheduleRepository::new());
    let lookup = Arc::new(InMemoryWorkflowDefinitionLookup::new());
    lookup.set_release_state(WORKFLOW, ReleaseState::Online);
    let creator = Arc::new(BlockingCreator {
        entered: Notify::new(),
        release: Notify::new(),
        created: AtomicUsize::new(0),
    });
    let service = Arc::new(ScheduleService::new(
        repository,
        lookup,
        creator.clone(),
        Arc::new(ManualClock::new(at(10, 15))),
        fast_config(),
    ));

    let id = service.create_schedule(hourly_request()).await.unwrap().id;
    service.online(id).await.unwrap();

    let tick = {
        let service = service.clone();
        tokio::spawn(async move { service.tick(at(11, 0)).await })
    };
    creator.entered.notified().await;

    let offline = {
        let service = service.clone();
        tokio::spawn(async move { service.offline(id).await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(!offline.is_finished(), "offline must wait for the in-flight fire");

    creator.release.notify_one();
    assert_eq!(tick.await.unwrap().fired, 1);
    assert!(!offline.await.unwrap().unwrap().is_online());

    // 下线之后的扫描不再触发
    assert_eq!(service.tick(at(12, 0)).await.fired, 0);
    assert_eq!(creator.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let f = fixture();
    let service = Arc::new(f.service);
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = {
        let service = service.clone();
        tokio::spawn(async move { service.run(rx).await })
    };
    f.clock.advance(Duration::minutes(1));
    let _ = tx.send(());
    tokio::time::timeout(StdDuration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
