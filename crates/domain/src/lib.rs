//! 短信发送追踪核心领域模型
//!
//! 包含发送请求、投递状态、重试计数与统计快照等核心类型及其校验规则。

pub mod dispatch;
pub mod errors;
pub mod message_delivery;
pub mod metrics;
pub mod retry_counter;
pub mod value_objects;

// 重新导出常用类型
pub use dispatch::*;
pub use errors::*;
pub use message_delivery::*;
pub use metrics::*;
pub use retry_counter::*;
pub use value_objects::*;
