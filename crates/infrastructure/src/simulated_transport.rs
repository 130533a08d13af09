//! 进程内模拟短信通道
//!
//! 按脚本依次决定每次发送调用的结果，用于演示程序与集成测试。
//! 脚本耗尽后使用默认结果。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use application::{
    segment_channel, DeliveryReport, MessageTransport, SegmentCompleter, SegmentReceipt,
    SendResultCode, TransportError,
};
use async_trait::async_trait;
use tokio::time::{sleep, Instant};

/// 单个分段的模拟结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub sent: SendResultCode,
    /// `None` 表示不会有送达回执
    pub delivery: Option<DeliveryReport>,
}

impl SegmentOutcome {
    pub fn delivered() -> Self {
        Self {
            sent: SendResultCode::Ok,
            delivery: Some(DeliveryReport::Ok),
        }
    }

    pub fn failed(code: SendResultCode) -> Self {
        Self {
            sent: code,
            delivery: None,
        }
    }
}

/// 一次发送调用的模拟行为
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallScript {
    /// 每个分段都按给定结果完成
    Complete(SegmentOutcome),
    /// 调用本身报错
    Reject(String),
    /// 不自动完成，由调用方通过 `take_held` 手动上报
    Hold,
}

/// 记录下来的一次发送调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSend {
    pub destination: String,
    pub segments: Vec<String>,
    pub at: Instant,
}

pub struct SimulatedTransport {
    script: Mutex<VecDeque<CallScript>>,
    default_script: CallScript,
    latency: Duration,
    fail_release: bool,
    calls: Mutex<Vec<RecordedSend>>,
    held: Mutex<Vec<SegmentCompleter>>,
    releases: AtomicUsize,
}

impl SimulatedTransport {
    /// 默认所有消息都成功发送并送达
    pub fn new() -> Self {
        Self::with_default(CallScript::Complete(SegmentOutcome::delivered()))
    }

    pub fn with_default(default_script: CallScript) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_script,
            latency: Duration::ZERO,
            fail_release: false,
            calls: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
        }
    }

    /// 发送结果与送达回执各自延迟 `latency` 后到达
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// 追加后续调用的脚本，按调用顺序消费
    pub fn push_script(&self, script: CallScript) {
        if let Ok(mut queue) = self.script.lock() {
            queue.push_back(script);
        }
    }

    pub fn calls(&self) -> Vec<RecordedSend> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 取出所有处于 `Hold` 状态的分段完成端
    pub fn take_held(&self) -> Vec<SegmentCompleter> {
        self.held
            .lock()
            .map(|mut held| std::mem::take(&mut *held))
            .unwrap_or_default()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> CallScript {
        self.script
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn record(&self, destination: &str, segments: Vec<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedSend {
                destination: destination.to_owned(),
                segments,
                at: Instant::now(),
            });
        }
    }

    fn open_segments(&self, count: usize) -> Result<Vec<SegmentReceipt>, TransportError> {
        let script = self.next_script();
        let mut receipts = Vec::with_capacity(count);
        let mut completers = Vec::with_capacity(count);
        for _ in 0..count {
            let (completer, receipt) = segment_channel();
            completers.push(completer);
            receipts.push(receipt);
        }

        match script {
            CallScript::Reject(reason) => return Err(TransportError::rejected(reason)),
            CallScript::Hold => {
                if let Ok(mut held) = self.held.lock() {
                    held.extend(completers);
                }
            }
            CallScript::Complete(outcome) => {
                for completer in completers {
                    self.complete(completer, outcome);
                }
            }
        }

        Ok(receipts)
    }

    fn complete(&self, mut completer: SegmentCompleter, outcome: SegmentOutcome) {
        if self.latency.is_zero() {
            completer.report_sent(outcome.sent);
            if let Some(report) = outcome.delivery {
                completer.report_delivery(report);
            }
            return;
        }

        let latency = self.latency;
        tokio::spawn(async move {
            sleep(latency).await;
            completer.report_sent(outcome.sent);
            if let Some(report) = outcome.delivery {
                sleep(latency).await;
                completer.report_delivery(report);
            }
        });
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for SimulatedTransport {
    async fn send_single(
        &self,
        destination: &str,
        body: &str,
    ) -> Result<SegmentReceipt, TransportError> {
        self.record(destination, vec![body.to_owned()]);
        let mut receipts = self.open_segments(1)?;
        receipts
            .pop()
            .ok_or_else(|| TransportError::Unavailable("no receipt produced".into()))
    }

    async fn send_multipart(
        &self,
        destination: &str,
        segments: &[String],
    ) -> Result<Vec<SegmentReceipt>, TransportError> {
        if segments.is_empty() {
            return Err(TransportError::rejected("empty multipart message"));
        }
        self.record(destination, segments.to_vec());
        self.open_segments(segments.len())
    }

    async fn release(&self) -> Result<(), TransportError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(TransportError::Release("receivers were not registered".into()));
        }
        tracing::debug!("Simulated transport released");
        Ok(())
    }
}
