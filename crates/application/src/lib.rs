//! 应用层实现。
//!
//! 这里提供围绕领域模型的发送追踪用例，处理号码校验、重试调度、
//! 统计汇总，以及对外部适配器（例如短信通道、网络状态）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod history;
pub mod metrics;
pub mod retry;
pub mod tracker;
pub mod transport;

pub use broadcaster::{StatusBroadcaster, StatusStream};
pub use clock::{Clock, SystemClock, TokioClock};
pub use error::ApplicationError;
pub use history::{DispatchHistory, MessageEntry};
pub use metrics::MetricsAccumulator;
pub use retry::{Backoff, RetryPolicy, RetryScheduler};
pub use tracker::{DispatchTracker, TrackerDependencies};
pub use transport::{
    segment_channel, DeliveryReport, MessageTransport, SegmentCompleter, SegmentReceipt,
    SendResultCode, ServiceState, TransportError,
};
