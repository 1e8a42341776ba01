//! Worker 在集群中的登记信息：服务的分组以及正在运行的任务

use std::collections::HashSet;
use std::sync::RwLock;

use chrono::Utc;

use scheduler_core::WorkerConfig;
use scheduler_remote::command::HeartBeatMessage;

pub trait WorkerRegistryClient: Send + Sync {
    fn worker_id(&self) -> String;

    fn serves_group(&self, worker_group: &str) -> bool;

    fn running_tasks(&self) -> usize;

    /// 登记开始执行的任务，已登记时返回 false
    fn task_started(&self, task_instance_id: i64) -> bool;

    fn task_finished(&self, task_instance_id: i64);

    /// 当前状态的心跳快照
    fn heartbeat(&self) -> HeartBeatMessage;
}

pub struct InMemoryWorkerRegistryClient {
    worker_id: String,
    worker_address: String,
    max_concurrent_tasks: usize,
    worker_groups: RwLock<Vec<String>>,
    running: RwLock<HashSet<i64>>,
}

impl InMemoryWorkerRegistryClient {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            worker_address: config.advertise_address.clone(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            worker_groups: RwLock::new(config.worker_groups.clone()),
            running: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_worker_groups(&self, groups: Vec<String>) {
        *self
            .worker_groups
            .write()
            .unwrap_or_else(|p| p.into_inner()) = groups;
    }
}

impl WorkerRegistryClient for InMemoryWorkerRegistryClient {
    fn worker_id(&self) -> String {
        self.worker_id.clone()
    }

    fn serves_group(&self, worker_group: &str) -> bool {
        self.worker_groups
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|g| g == worker_group)
    }

    fn running_tasks(&self) -> usize {
        self.running.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn task_started(&self, task_instance_id: i64) -> bool {
        self.running
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_instance_id)
    }

    fn task_finished(&self, task_instance_id: i64) {
        self.running
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_instance_id);
    }

    fn heartbeat(&self) -> HeartBeatMessage {
        HeartBeatMessage {
            worker_id: self.worker_id.clone(),
            worker_address: self.worker_address.clone(),
            worker_groups: self
                .worker_groups
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            running_tasks: self.running_tasks() as u32,
            max_concurrent_tasks: self.max_concurrent_tasks as u32,
            report_time_millis: Utc::now().timestamp_millis(),
        }
    }
}
