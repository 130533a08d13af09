// 本地状态广播器实现
use domain::{DeliveryStatus, DispatchId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<DeliveryStatus>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryStatus> {
        self.sender.subscribe()
    }

    /// 推送一次状态变化，没有订阅者时直接丢弃
    pub fn publish(&self, status: DeliveryStatus) {
        if self.sender.send(status).is_err() {
            tracing::trace!("No status subscribers, update dropped");
        }
    }
}

// 只关注单个发送请求的状态流
pub struct StatusStream {
    receiver: broadcast::Receiver<DeliveryStatus>,
    dispatch_id: DispatchId,
}

impl StatusStream {
    pub fn new(receiver: broadcast::Receiver<DeliveryStatus>, dispatch_id: DispatchId) -> Self {
        Self {
            receiver,
            dispatch_id,
        }
    }

    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    pub async fn recv(&mut self) -> Option<DeliveryStatus> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => {
                    // 过滤只属于当前请求的状态
                    if status.dispatch_id == self.dispatch_id {
                        return Some(status);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        dispatch_id = %self.dispatch_id,
                        skipped,
                        "Status stream lagged behind"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
