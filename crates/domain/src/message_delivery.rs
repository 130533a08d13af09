use serde::{Deserialize, Serialize};

use crate::value_objects::{DispatchId, Timestamp};

/// 平台上报的错误码
pub mod error_codes {
    /// 由追踪器自身判定的失败（重试耗尽、送达确认缺失、取消）
    pub const TRACKER_FAILURE: i32 = -1;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const RADIO_OFF: i32 = 2;
    pub const NULL_PAYLOAD: i32 = 3;
    pub const NO_SERVICE: i32 = 4;
}

/// 短信投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Failed,
    NetworkError,
    InvalidNumber,
    NoService,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Sending => "SENDING",
            DeliveryState::Sent => "SENT",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::Failed => "FAILED",
            DeliveryState::NetworkError => "NETWORK_ERROR",
            DeliveryState::InvalidNumber => "INVALID_NUMBER",
            DeliveryState::NoService => "NO_SERVICE",
        }
    }
}

/// 某次发送请求的最新状态，每个标识只保留一条（后写覆盖）
///
/// `NoService` 与 `NetworkError` 在仍有重试预算时只是中间状态，
/// 请求是否结束以 `settled` 为准。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub dispatch_id: DispatchId,
    pub destination: String,
    pub state: DeliveryState,
    pub timestamp: Timestamp,
    pub error_code: Option<i32>,
    pub error_message: Option<String>,
    /// 此后该标识不会再有任何状态事件
    #[serde(default)]
    pub settled: bool,
}

impl DeliveryStatus {
    pub fn new(
        dispatch_id: DispatchId,
        destination: impl Into<String>,
        state: DeliveryState,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            dispatch_id,
            destination: destination.into(),
            state,
            timestamp,
            error_code: None,
            error_message: None,
            settled: false,
        }
    }

    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_settled(mut self, settled: bool) -> Self {
        self.settled = settled;
        self
    }

    /// 是否为该标识的最后一条状态
    pub fn is_final(&self) -> bool {
        self.settled
    }
}
