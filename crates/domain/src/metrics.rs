use serde::{Deserialize, Serialize};

/// 一个发送请求最终归入的统计类别，每个请求至多归入一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeBucket {
    Delivered,
    Failed,
    NetworkError,
}

/// 发送统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// 调用 submit 的总次数，无论结果如何
    pub total_messages_sent: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub network_errors: u64,
    /// 读取时所有未结束请求的重试计数之和
    pub retry_attempts: u64,
    /// 已送达请求从创建到送达的平均耗时（毫秒）
    pub average_delivery_time_ms: u64,
}

impl AggregateMetrics {
    /// 已归入某个结果类别的请求数
    pub fn settled_total(&self) -> u64 {
        self.successful_deliveries + self.failed_deliveries + self.network_errors
    }
}
