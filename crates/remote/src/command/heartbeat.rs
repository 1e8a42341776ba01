use serde::{Deserialize, Serialize};

use super::MessageBody;
use crate::message::MessageType;

/// Worker 定期上报的心跳，Master 用其中的地址登记通道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeatMessage {
    pub worker_id: String,
    /// Worker 对外公布的地址，作为 Master 侧的通道键
    pub worker_address: String,
    pub worker_groups: Vec<String>,
    pub running_tasks: u32,
    pub max_concurrent_tasks: u32,
    pub report_time_millis: i64,
}

impl HeartBeatMessage {
    pub fn load_factor(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.running_tasks as f64 / self.max_concurrent_tasks as f64
    }
}

impl MessageBody for HeartBeatMessage {
    const MESSAGE_TYPE: MessageType = MessageType::HeartBeat;
}
