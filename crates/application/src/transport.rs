//! 短信通道抽象
//!
//! 追踪器只依赖这里定义的契约：发送调用立即返回每个分段的完成句柄，
//! 发送结果与送达回执稍后通过句柄异步到达。

use async_trait::async_trait;
use domain::error_codes;
use thiserror::Error;
use tokio::sync::oneshot;

/// 通道上报的发送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResultCode {
    Ok,
    NoService,
    RadioOff,
    GenericFailure,
    NullPayload,
}

impl SendResultCode {
    /// 对应的平台错误码，成功时为 `None`
    pub fn error_code(self) -> Option<i32> {
        match self {
            SendResultCode::Ok => None,
            SendResultCode::NoService => Some(error_codes::NO_SERVICE),
            SendResultCode::RadioOff => Some(error_codes::RADIO_OFF),
            SendResultCode::GenericFailure => Some(error_codes::GENERIC_FAILURE),
            SendResultCode::NullPayload => Some(error_codes::NULL_PAYLOAD),
        }
    }
}

/// 短信中心返回的送达回执，粒度比发送结果更粗
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReport {
    Ok,
    Canceled,
}

/// 单个分段的完成句柄
///
/// 发送端被丢弃视为通用发送失败；回执端被丢弃表示不会再有送达回执。
#[derive(Debug)]
pub struct SegmentReceipt {
    pub sent: oneshot::Receiver<SendResultCode>,
    pub delivered: oneshot::Receiver<DeliveryReport>,
}

/// 通道一侧持有的完成端，用于上报某个分段的结果
#[derive(Debug)]
pub struct SegmentCompleter {
    sent: Option<oneshot::Sender<SendResultCode>>,
    delivered: Option<oneshot::Sender<DeliveryReport>>,
}

impl SegmentCompleter {
    /// 上报发送结果，重复上报或接收方已关闭时返回 false
    pub fn report_sent(&mut self, code: SendResultCode) -> bool {
        match self.sent.take() {
            Some(sender) => sender.send(code).is_ok(),
            None => false,
        }
    }

    /// 上报送达回执，重复上报或接收方已关闭时返回 false
    pub fn report_delivery(&mut self, report: DeliveryReport) -> bool {
        match self.delivered.take() {
            Some(sender) => sender.send(report).is_ok(),
            None => false,
        }
    }
}

/// 创建一对分段完成端与完成句柄
pub fn segment_channel() -> (SegmentCompleter, SegmentReceipt) {
    let (sent_tx, sent_rx) = oneshot::channel();
    let (delivered_tx, delivered_rx) = oneshot::channel();
    (
        SegmentCompleter {
            sent: Some(sent_tx),
            delivered: Some(delivered_tx),
        },
        SegmentReceipt {
            sent: sent_rx,
            delivered: delivered_rx,
        },
    )
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rejected message: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("failed to release transport: {0}")]
    Release(String),
}

impl TransportError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// 发送单条短信
    async fn send_single(
        &self,
        destination: &str,
        body: &str,
    ) -> Result<SegmentReceipt, TransportError>;

    /// 发送拆分后的长短信，每个分段返回一个完成句柄
    async fn send_multipart(
        &self,
        destination: &str,
        segments: &[String],
    ) -> Result<Vec<SegmentReceipt>, TransportError>;

    /// 释放平台侧注册的回调
    async fn release(&self) -> Result<(), TransportError>;
}

/// 发送前置条件：SIM 卡就绪且已注册到网络
#[cfg_attr(test, mockall::automock)]
pub trait ServiceState: Send + Sync {
    fn sim_ready(&self) -> bool;

    fn network_registered(&self) -> bool;
}
