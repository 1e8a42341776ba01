use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::split;

use scheduler_core::{
    SchedulerError, SchedulerResult, TaskExecutionContext, TaskExecutionStatus, TransportConfig,
};
use scheduler_dispatcher::{HeartBeatHandler, TaskDispatcher, TaskEventHandler, TaskEventTracker};
use scheduler_remote::command::{
    HeartBeatMessage, TaskEventAckMessage, TaskExecuteFinishMessage, TaskExecuteStartMessage,
    TaskExecuteStartedMessage, TaskKillMessage, TaskKillResponseMessage,
};
use scheduler_remote::{
    ChannelDirectory, HandlerRegistry, Message, MessageBody, MessageContext, MessageHandler,
    MessageType, RemoteChannel,
};

const MASTER: &str = "master:5678";
const WORKER: &str = "worker:1234";

/// 接受任务ID为偶数的分发，拒绝奇数；ID 不小于 100 时先上报结束再确认分发
struct FakeWorker;

#[async_trait]
impl MessageHandler for FakeWorker {
    async fn handle(
        &self,
        message: Message,
        channel: &RemoteChannel,
    ) -> SchedulerResult<Option<Message>> {
        match message.message_type {
            MessageType::TaskExecuteStart => {
                let start: TaskExecuteStartMessage = message.body_as()?;
                let id = start.task_execution_context.task_instance_id;
                if id >= 100 {
                    let done = finish(id, TaskExecutionStatus::Success)
                        .to_request(MessageContext::new(WORKER, MASTER))?;
                    let ack: TaskEventAckMessage = channel
                        .send_and_await_reply(done, Duration::from_secs(2))
                        .await?
                        .body_as()?;
                    if !ack.success {
                        return Err(SchedulerError::Internal("结束上报未被确认".into()));
                    }
                }
                let ack = if id % 2 == 0 {
                    TaskEventAckMessage::ok(id)
                } else {
                    TaskEventAckMessage::failed(id, "worker group not served")
                };
                Ok(Some(ack.to_reply(&message)?))
            }
            MessageType::TaskKill => {
                let kill: TaskKillMessage = message.body_as()?;
                let response = TaskKillResponseMessage {
                    task_instance_id: kill.task_instance_id,
                    killed: true,
                    status: Some(TaskExecutionStatus::Killed),
                    message: None,
                };
                Ok(Some(response.to_reply(&message)?))
            }
            _ => Ok(None),
        }
    }
}

struct Cluster {
    dispatcher: TaskDispatcher,
    tracker: Arc<TaskEventTracker>,
    heartbeats: Arc<HeartBeatHandler>,
    worker: RemoteChannel,
}

async fn cluster() -> Cluster {
    let directory = ChannelDirectory::new();
    let tracker = Arc::new(TaskEventTracker::new());
    let heartbeats = Arc::new(HeartBeatHandler::new(directory.clone()));
    let events = Arc::new(TaskEventHandler::new(tracker.clone()));

    let master_handlers = HandlerRegistry::new()
        .with(MessageType::HeartBeat, heartbeats.clone())
        .with(MessageType::TaskExecuteStarted, events.clone())
        .with(MessageType::TaskExecuteRunning, events.clone())
        .with(MessageType::TaskExecuteFinish, events.clone())
        .with(MessageType::TaskReject, events);
    let worker_handlers = HandlerRegistry::new()
        .with(MessageType::TaskExecuteStart, Arc::new(FakeWorker))
        .with(MessageType::TaskKill, Arc::new(FakeWorker));

    let config = TransportConfig::default();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = split(a);
    let (br, bw) = split(b);
    let _master = RemoteChannel::spawn(ar, aw, MASTER, WORKER, Arc::new(master_handlers), &config);
    let worker = RemoteChannel::spawn(br, bw, WORKER, MASTER, Arc::new(worker_handlers), &config);

    let heartbeat = HeartBeatMessage {
        worker_id: "worker-001".into(),
        worker_address: WORKER.into(),
        worker_groups: vec!["default".into()],
        running_tasks: 0,
        max_concurrent_tasks: 4,
        report_time_millis: Utc::now().timestamp_millis(),
    };
    worker
        .send(heartbeat.to_request(MessageContext::new(WORKER, MASTER)).unwrap())
        .await
        .unwrap();

    for _ in 0..50 {
        if directory.get(WORKER).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Cluster {
        dispatcher: TaskDispatcher::new(MASTER, directory, tracker.clone(), Duration::from_secs(2)),
        tracker,
        heartbeats,
        worker,
    }
}

async fn report(worker: &RemoteChannel, message: Message) -> TaskEventAckMessage {
    worker
        .send_and_await_reply(message, Duration::from_secs(2))
        .await
        .unwrap()
        .body_as()
        .unwrap()
}

fn finish(id: i64, status: TaskExecutionStatus) -> TaskExecuteFinishMessage {
    TaskExecuteFinishMessage {
        task_instance_id: id,
        workflow_instance_id: 1,
        host: WORKER.into(),
        status,
        exit_code: Some(0),
        error_message: None,
        end_time_millis: Utc::now().timestamp_millis(),
        execution_time_ms: 5,
    }
}

#[tokio::test]
async fn test_heartbeat_registers_worker_channel() {
    let cluster = cluster().await;
    assert_eq!(cluster.heartbeats.select_worker("default").as_deref(), Some(WORKER));
    assert!(cluster.heartbeats.select_worker("gpu").is_none());
    assert_eq!(cluster.heartbeats.last_heartbeat(WORKER).unwrap().max_concurrent_tasks, 4);
}

#[tokio::test]
async fn test_dispatch_and_lifecycle_reports() {
    let cluster = cluster().await;
    let context = TaskExecutionContext::new(2, "extract", "shell");
    cluster.dispatcher.dispatch(context, WORKER).await.unwrap();
    assert_eq!(
        cluster.tracker.get(2).unwrap().status,
        TaskExecutionStatus::Dispatched
    );

    let started = TaskExecuteStartedMessage {
        task_instance_id: 2,
        workflow_instance_id: 1,
        host: WORKER.into(),
        start_time_millis: Utc::now().timestamp_millis(),
        status: TaskExecutionStatus::Running,
    };
    let ack = report(
        &cluster.worker,
        started.to_request(MessageContext::new(WORKER, MASTER)).unwrap(),
    )
    .await;
    assert!(ack.success);
    assert_eq!(cluster.tracker.get(2).unwrap().status, TaskExecutionStatus::Running);

    let done = finish(2, TaskExecutionStatus::Success);
    let ack = report(
        &cluster.worker,
        done.to_request(MessageContext::new(WORKER, MASTER)).unwrap(),
    )
    .await;
    assert!(ack.success);

    // 重试带来的重复上报同样被确认，状态不变
    let ack = report(
        &cluster.worker,
        finish(2, TaskExecutionStatus::Failure)
            .to_request(MessageContext::new(WORKER, MASTER))
            .unwrap(),
    )
    .await;
    assert!(ack.success);

    let tracked = cluster.tracker.get(2).unwrap();
    assert_eq!(tracked.status, TaskExecutionStatus::Success);
    assert_eq!(tracked.exit_code, Some(0));
}

#[tokio::test]
async fn test_finish_reported_before_dispatch_ack_is_kept() {
    let cluster = cluster().await;
    let context = TaskExecutionContext::new(100, "quick", "shell");
    cluster.dispatcher.dispatch(context, WORKER).await.unwrap();

    let tracked = cluster.tracker.get(100).unwrap();
    assert_eq!(tracked.status, TaskExecutionStatus::Success);
    assert_eq!(tracked.exit_code, Some(0));
    assert_eq!(tracked.worker_address, WORKER);
}

#[tokio::test]
async fn test_rejected_dispatch_is_not_tracked() {
    let cluster = cluster().await;
    let context = TaskExecutionContext::new(3, "extract", "shell");

    let result = cluster.dispatcher.dispatch(context, WORKER).await;
    assert!(matches!(
        result,
        Err(SchedulerError::TaskRejected { task_instance_id: 3, .. })
    ));
    assert!(cluster.tracker.get(3).is_none());
}

#[tokio::test]
async fn test_dispatch_to_unknown_worker_fails() {
    let cluster = cluster().await;
    let context = TaskExecutionContext::new(4, "extract", "shell");
    assert!(matches!(
        cluster.dispatcher.dispatch(context, "nowhere:1").await,
        Err(SchedulerError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn test_kill_routes_to_owning_worker() {
    let cluster = cluster().await;
    cluster
        .dispatcher
        .dispatch(TaskExecutionContext::new(6, "load", "shell"), WORKER)
        .await
        .unwrap();

    let response = cluster.dispatcher.kill(6, Some("manual".into())).await.unwrap();
    assert!(response.killed);
    assert_eq!(response.status, Some(TaskExecutionStatus::Killed));

    assert!(matches!(
        cluster.dispatcher.kill(99, None).await,
        Err(SchedulerError::TaskNotFound { id: 99 })
    ));
}
