//! 基础设施层实现。
//!
//! 提供短信通道、网络状态等适配器，实现应用层定义的接口。

pub mod service_state;
pub mod simulated_transport;

pub use service_state::StaticServiceState;
pub use simulated_transport::{CallScript, RecordedSend, SegmentOutcome, SimulatedTransport};
