use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain::DispatchId;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    /// 第 `attempt` 次重试（从 0 开始）前的等待时间：base * 2^attempt
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt, 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(base_delay),
        }
    }
}

struct PendingTimer {
    sequence: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct TimerTable {
    next_sequence: u64,
    timers: HashMap<DispatchId, PendingTimer>,
}

/// 按发送标识管理的可取消延时任务
///
/// 同一标识同时只保留一个定时器，重新安排会取消旧的。
/// 所有定时器都挂在根令牌下，取消根令牌即全部取消。
#[derive(Clone)]
pub struct RetryScheduler {
    root: CancellationToken,
    table: Arc<Mutex<TimerTable>>,
}

impl RetryScheduler {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            table: Arc::new(Mutex::new(TimerTable::default())),
        }
    }

    /// 在 `delay` 之后执行 `task`，除非期间被取消
    pub fn schedule<F>(&self, id: DispatchId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let sequence = {
            let Ok(mut table) = self.table.lock() else {
                tracing::error!(dispatch_id = %id, "Retry timer table poisoned, retry dropped");
                return;
            };
            table.next_sequence += 1;
            let sequence = table.next_sequence;
            if let Some(previous) = table.timers.insert(
                id,
                PendingTimer {
                    sequence,
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
            sequence
        };

        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(dispatch_id = %id, "Retry timer cancelled");
                }
                _ = sleep(delay) => {
                    if let Ok(mut table) = table.lock() {
                        if table.timers.get(&id).map(|t| t.sequence) == Some(sequence) {
                            table.timers.remove(&id);
                        }
                    }
                    task.await;
                }
            }
        });
    }

    /// 取消某个标识的定时器，返回是否存在待执行的定时器
    pub fn cancel(&self, id: DispatchId) -> bool {
        let Ok(mut table) = self.table.lock() else {
            return false;
        };
        match table.timers.remove(&id) {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
        if let Ok(mut table) = self.table.lock() {
            table.timers.clear();
        }
    }
}
