//! 发送历史投影
//!
//! 把状态事件流折叠成按时间倒序排列的消息列表：新标识插入到最前，
//! 已知标识原地更新状态与错误信息。

use std::sync::Arc;

use domain::{DeliveryState, DeliveryStatus, DispatchId, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use crate::error::ApplicationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageEntry {
    pub id: DispatchId,
    pub destination: String,
    pub content: String,
    pub state: DeliveryState,
    /// 首次看到该请求的时间
    pub timestamp: Timestamp,
    pub error_message: Option<String>,
    /// 已收到该请求的最后一条状态
    pub settled: bool,
}

#[derive(Debug, Default)]
pub struct DispatchHistory {
    entries: Vec<MessageEntry>,
}

impl DispatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, status: &DeliveryStatus) {
        match self.entries.iter_mut().find(|e| e.id == status.dispatch_id) {
            Some(entry) => {
                entry.state = status.state;
                entry.error_message = status.error_message.clone();
                entry.settled = status.settled;
            }
            None => self.entries.insert(
                0,
                MessageEntry {
                    id: status.dispatch_id,
                    destination: status.destination.clone(),
                    content: String::new(),
                    state: status.state,
                    timestamp: status.timestamp,
                    error_message: status.error_message.clone(),
                    settled: status.settled,
                },
            ),
        }
    }

    /// 提交返回后补上消息正文
    pub fn attach_content(
        &mut self,
        id: DispatchId,
        content: impl Into<String>,
    ) -> Result<(), ApplicationError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(ApplicationError::UnknownDispatch(id))?;
        entry.content = content.into();
        Ok(())
    }

    pub fn get(&self, id: DispatchId) -> Option<&MessageEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 持续消费状态事件直到通道关闭
    pub async fn follow(
        history: Arc<RwLock<DispatchHistory>>,
        mut receiver: broadcast::Receiver<DeliveryStatus>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(status) => history.write().await.apply(&status),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "History lagged behind status stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("History follower stopped");
    }
}
