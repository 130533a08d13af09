use std::time::Duration;

use domain::{AggregateMetrics, OutcomeBucket};

/// 由追踪器实例持有的统计累加器，计数只增不减
#[derive(Debug, Default, Clone)]
pub struct MetricsAccumulator {
    total_messages_sent: u64,
    successful_deliveries: u64,
    failed_deliveries: u64,
    network_errors: u64,
    delivery_time_total_ms: u128,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&mut self) {
        self.total_messages_sent += 1;
    }

    /// 记录一个请求的最终归类；送达时附带从创建到送达的耗时
    pub fn record_outcome(&mut self, bucket: OutcomeBucket, delivery_time: Option<Duration>) {
        match bucket {
            OutcomeBucket::Delivered => {
                self.successful_deliveries += 1;
                self.delivery_time_total_ms += delivery_time.unwrap_or_default().as_millis();
            }
            OutcomeBucket::Failed => self.failed_deliveries += 1,
            OutcomeBucket::NetworkError => self.network_errors += 1,
        }
    }

    /// 生成快照，`retry_attempts` 由调用方按当前重试计数求和传入
    pub fn snapshot(&self, retry_attempts: u64) -> AggregateMetrics {
        let average_delivery_time_ms = if self.successful_deliveries == 0 {
            0
        } else {
            let average = self.delivery_time_total_ms / u128::from(self.successful_deliveries);
            u64::try_from(average).unwrap_or(u64::MAX)
        };

        AggregateMetrics {
            total_messages_sent: self.total_messages_sent,
            successful_deliveries: self.successful_deliveries,
            failed_deliveries: self.failed_deliveries,
            network_errors: self.network_errors,
            retry_attempts,
            average_delivery_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_land_in_one_bucket() {
        let mut metrics = MetricsAccumulator::new();
        for _ in 0..4 {
            metrics.record_submitted();
        }
        metrics.record_outcome(OutcomeBucket::Delivered, Some(Duration::from_millis(300)));
        metrics.record_outcome(OutcomeBucket::Failed, None);
        metrics.record_outcome(OutcomeBucket::NetworkError, None);

        let snapshot = metrics.snapshot(2);
        assert_eq!(snapshot.total_messages_sent, 4);
        assert_eq!(snapshot.successful_deliveries, 1);
        assert_eq!(snapshot.failed_deliveries, 1);
        assert_eq!(snapshot.network_errors, 1);
        assert_eq!(snapshot.retry_attempts, 2);
        assert!(snapshot.settled_total() <= snapshot.total_messages_sent);
    }

    #[test]
    fn test_average_delivery_time() {
        let mut metrics = MetricsAccumulator::new();
        assert_eq!(metrics.snapshot(0).average_delivery_time_ms, 0);

        metrics.record_outcome(OutcomeBucket::Delivered, Some(Duration::from_millis(1000)));
        metrics.record_outcome(OutcomeBucket::Delivered, Some(Duration::from_millis(3000)));
        assert_eq!(metrics.snapshot(0).average_delivery_time_ms, 2000);
    }
}
