use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 上线状态，调度与工作流定义共用
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseState {
    #[default]
    Offline,
    Online,
}

/// 工作流任务失败后的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    #[default]
    Continue,
    End,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningType {
    #[default]
    None,
    Success,
    Failure,
    All,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Medium,
    Low,
    Lowest,
}

/// 调度配置
///
/// 只持有工作流定义的编码（反向引用），不拥有工作流定义本身。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: i64,
    pub project_code: i64,
    pub workflow_definition_code: i64,
    pub crontab: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub timezone_id: String,
    pub release_state: ReleaseState,
    pub failure_strategy: FailureStrategy,
    pub warning_type: WarningType,
    pub warning_group_id: i32,
    pub workflow_instance_priority: Priority,
    pub worker_group: String,
    pub tenant_code: String,
    pub environment_code: Option<i64>,
    /// 引擎最近一次发出触发事件的逻辑时间，重启后用于补偿计算
    pub last_fire_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Schedule {
    pub fn is_online(&self) -> bool {
        self.release_state == ReleaseState::Online
    }

    /// 生成给定逻辑时间的触发事件
    pub fn trigger_event(
        &self,
        schedule_time: DateTime<Utc>,
        fire_time: DateTime<Utc>,
        catch_up: bool,
    ) -> TriggerEvent {
        TriggerEvent {
            schedule_id: self.id,
            project_code: self.project_code,
            workflow_definition_code: self.workflow_definition_code,
            schedule_time,
            fire_time,
            priority: self.workflow_instance_priority,
            worker_group: self.worker_group.clone(),
            tenant_code: self.tenant_code.clone(),
            environment_code: self.environment_code,
            failure_strategy: self.failure_strategy,
            warning_type: self.warning_type,
            warning_group_id: self.warning_group_id,
            catch_up,
        }
    }
}

/// 创建调度请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateRequest {
    pub project_code: i64,
    pub workflow_definition_code: i64,
    pub crontab: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default = "default_timezone")]
    pub timezone_id: String,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub warning_type: WarningType,
    #[serde(default)]
    pub warning_group_id: i32,
    #[serde(default)]
    pub workflow_instance_priority: Priority,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    #[serde(default = "default_tenant_code")]
    pub tenant_code: String,
    #[serde(default)]
    pub environment_code: Option<i64>,
}

impl ScheduleCreateRequest {
    pub fn new(
        project_code: i64,
        workflow_definition_code: i64,
        crontab: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            project_code,
            workflow_definition_code,
            crontab: crontab.into(),
            start_time,
            end_time,
            timezone_id: default_timezone(),
            failure_strategy: FailureStrategy::default(),
            warning_type: WarningType::default(),
            warning_group_id: 0,
            workflow_instance_priority: Priority::default(),
            worker_group: default_worker_group(),
            tenant_code: default_tenant_code(),
            environment_code: None,
        }
    }
}

/// 更新调度请求，未设置的字段保持原值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdateRequest {
    pub crontab: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone_id: Option<String>,
    pub failure_strategy: Option<FailureStrategy>,
    pub warning_type: Option<WarningType>,
    pub warning_group_id: Option<i32>,
    pub workflow_instance_priority: Option<Priority>,
    pub worker_group: Option<String>,
    pub tenant_code: Option<String>,
    /// `Some(None)` 清除环境编码
    pub environment_code: Option<Option<i64>>,
}

impl ScheduleUpdateRequest {
    pub fn apply_to(&self, schedule: &mut Schedule) {
        if let Some(ref crontab) = self.crontab {
            schedule.crontab = crontab.clone();
        }
        if let Some(start_time) = self.start_time {
            schedule.start_time = start_time;
        }
        if let Some(end_time) = self.end_time {
            schedule.end_time = end_time;
        }
        if let Some(ref timezone_id) = self.timezone_id {
            schedule.timezone_id = timezone_id.clone();
        }
        if let Some(failure_strategy) = self.failure_strategy {
            schedule.failure_strategy = failure_strategy;
        }
        if let Some(warning_type) = self.warning_type {
            schedule.warning_type = warning_type;
        }
        if let Some(warning_group_id) = self.warning_group_id {
            schedule.warning_group_id = warning_group_id;
        }
        if let Some(priority) = self.workflow_instance_priority {
            schedule.workflow_instance_priority = priority;
        }
        if let Some(ref worker_group) = self.worker_group {
            schedule.worker_group = worker_group.clone();
        }
        if let Some(ref tenant_code) = self.tenant_code {
            schedule.tenant_code = tenant_code.clone();
        }
        if let Some(environment_code) = self.environment_code {
            schedule.environment_code = environment_code;
        }
    }
}

/// 触发时间预览请求，只计算不保存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePreviewRequest {
    pub crontab: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_timezone")]
    pub timezone_id: String,
    /// 缺省时返回 5 个
    #[serde(default)]
    pub count: Option<usize>,
}

impl SchedulePreviewRequest {
    pub fn new(crontab: impl Into<String>) -> Self {
        Self {
            crontab: crontab.into(),
            start_time: None,
            end_time: None,
            timezone_id: default_timezone(),
            count: None,
        }
    }
}

/// 调度筛选条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFilter {
    pub project_code: Option<i64>,
    pub workflow_definition_code: Option<i64>,
    pub release_state: Option<ReleaseState>,
    /// 调度有效期与 `[start_time, end_time]` 存在交集
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page_no: usize,
    pub page_size: usize,
}

impl Default for ScheduleFilter {
    fn default() -> Self {
        Self {
            project_code: None,
            workflow_definition_code: None,
            release_state: None,
            start_time: None,
            end_time: None,
            page_no: 1,
            page_size: 10,
        }
    }
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        if let Some(project_code) = self.project_code {
            if schedule.project_code != project_code {
                return false;
            }
        }
        if let Some(code) = self.workflow_definition_code {
            if schedule.workflow_definition_code != code {
                return false;
            }
        }
        if let Some(state) = self.release_state {
            if schedule.release_state != state {
                return false;
            }
        }
        if let Some(start_time) = self.start_time {
            if schedule.end_time < start_time {
                return false;
            }
        }
        if let Some(end_time) = self.end_time {
            if schedule.start_time > end_time {
                return false;
            }
        }
        true
    }
}

/// 分页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInfo<T> {
    pub total: usize,
    pub page_no: usize,
    pub page_size: usize,
    pub items: Vec<T>,
}

/// 调度到点产生的触发事件，由外部的工作流实例创建能力立即消费
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerEvent {
    pub schedule_id: i64,
    pub project_code: i64,
    pub workflow_definition_code: i64,
    /// CRON计算出的逻辑触发时间
    pub schedule_time: DateTime<Utc>,
    /// 实际发出事件的时间
    pub fire_time: DateTime<Utc>,
    pub priority: Priority,
    pub worker_group: String,
    pub tenant_code: String,
    pub environment_code: Option<i64>,
    pub failure_strategy: FailureStrategy,
    pub warning_type: WarningType,
    pub warning_group_id: i32,
    /// 停机期间错过、事后补发的事件
    pub catch_up: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_worker_group() -> String {
    "default".to_string()
}

fn default_tenant_code() -> String {
    "default".to_string()
}
