//! 短信发送追踪器
//!
//! 负责把消息交给短信通道、把异步到达的发送结果与送达回执关联回原始请求，
//! 在失败时按指数退避重试，并维护发送统计。
//!
//! 所有状态变更都在同一把锁内完成并立即广播，因此同一请求的状态事件顺序
//! 与变更顺序一致。任何失败都只会体现为状态事件，不会向调用方返回错误。
//! 请求结束后立即从活动表中移除，只在有界的结束记录中保留最后状态。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use config::DispatchConfig;
use domain::{
    error_codes, AggregateMetrics, DeliveryState, DeliveryStatus, DispatchId, DispatchRequest,
    OutcomeBucket, PhoneNumber, RetryCounter,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcaster::{StatusBroadcaster, StatusStream};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::metrics::MetricsAccumulator;
use crate::retry::{RetryPolicy, RetryScheduler};
use crate::transport::{
    DeliveryReport, MessageTransport, SegmentReceipt, SendResultCode, ServiceState,
};

const NO_SERVICE_MESSAGE: &str = "No cellular service available";
const NETWORK_ERROR_MESSAGE: &str = "Network error occurred";
const DELIVERY_NOT_CONFIRMED_MESSAGE: &str = "Delivery confirmation not received";
const CANCELLED_MESSAGE: &str = "Dispatch cancelled";

pub struct TrackerDependencies {
    pub transport: Arc<dyn MessageTransport>,
    pub service_state: Arc<dyn ServiceState>,
    pub clock: Arc<dyn Clock>,
    pub config: DispatchConfig,
}

#[derive(Clone)]
pub struct DispatchTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    transport: Arc<dyn MessageTransport>,
    service_state: Arc<dyn ServiceState>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    single_segment_limit: usize,
    multipart_segment_len: usize,
    state: Mutex<TrackerState>,
    statuses: StatusBroadcaster,
    metrics_tx: watch::Sender<AggregateMetrics>,
    scheduler: RetryScheduler,
    root: CancellationToken,
}

struct TrackerState {
    /// 尚未结束的请求
    entries: HashMap<DispatchId, DispatchEntry>,
    settled: SettledLog,
    metrics: MetricsAccumulator,
    /// 活动请求重试次数之和
    retry_attempts: u64,
    closed: bool,
}

/// 已结束请求的最后状态，按结束顺序淘汰
struct SettledLog {
    capacity: usize,
    statuses: HashMap<DispatchId, DeliveryStatus>,
    order: VecDeque<DispatchId>,
}

impl SettledLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            statuses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, status: DeliveryStatus) {
        let id = status.dispatch_id;
        if self.statuses.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &DispatchId) -> Option<&DeliveryStatus> {
        self.statuses.get(id)
    }
}

struct DispatchEntry {
    destination: String,
    /// 原始请求，重试时原样重发
    request: Option<DispatchRequest>,
    status: Option<DeliveryStatus>,
    retries: RetryCounter,
    /// 每次重发加一，旧批次的回调据此丢弃
    generation: u32,
    segments: usize,
    sent_segments: usize,
    delivered_segments: usize,
    correlation: Option<CancellationToken>,
}

impl DispatchEntry {
    fn new(destination: &str, max_attempts: u32) -> Self {
        Self {
            destination: destination.to_owned(),
            request: None,
            status: None,
            retries: RetryCounter::new(max_attempts),
            generation: 0,
            segments: 0,
            sent_segments: 0,
            delivered_segments: 0,
            correlation: None,
        }
    }

    fn is_current(&self, generation: u32) -> bool {
        self.generation == generation
    }

    fn state(&self) -> Option<DeliveryState> {
        self.status.as_ref().map(|status| status.state)
    }
}

enum FailureClass {
    NoService,
    NetworkError,
    Generic { code: i32, reason: String },
}

enum Signal {
    Sent(SendResultCode),
    SentDropped,
    Delivered(DeliveryReport),
    NoReport,
}

type StatusDetail = Option<(i32, String)>;

impl DispatchTracker {
    pub fn new(deps: TrackerDependencies) -> Result<Self, ApplicationError> {
        deps.config.check()?;

        let root = CancellationToken::new();
        let (metrics_tx, _) = watch::channel(AggregateMetrics::default());

        let inner = TrackerInner {
            transport: deps.transport,
            service_state: deps.service_state,
            clock: deps.clock,
            policy: RetryPolicy::new(deps.config.max_retry_attempts, deps.config.base_retry_delay()),
            single_segment_limit: deps.config.single_segment_limit,
            multipart_segment_len: deps.config.multipart_segment_len,
            state: Mutex::new(TrackerState {
                entries: HashMap::new(),
                settled: SettledLog::new(deps.config.settled_retention),
                metrics: MetricsAccumulator::new(),
                retry_attempts: 0,
                closed: false,
            }),
            statuses: StatusBroadcaster::new(deps.config.status_channel_capacity),
            metrics_tx,
            scheduler: RetryScheduler::new(root.child_token()),
            root,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// 提交一条短信，交给通道后立即返回标识；后续状态通过订阅获得
    pub async fn submit(&self, destination: &str, payload: &str) -> DispatchId {
        let inner = &self.inner;
        let id = DispatchId::generate();
        let prerequisites_met = inner.prerequisites_met();

        {
            let mut state = inner.state.lock().await;
            state.metrics.record_submitted();

            let mut entry = DispatchEntry::new(destination, inner.policy.max_attempts);

            if state.closed || !prerequisites_met {
                state.entries.insert(id, entry);
                inner.finalize(
                    &mut state,
                    id,
                    DeliveryState::NoService,
                    Some((error_codes::NO_SERVICE, NO_SERVICE_MESSAGE.to_owned())),
                    None,
                );
                return id;
            }

            match PhoneNumber::parse(destination) {
                Ok(number) => {
                    entry.request = Some(DispatchRequest::new(
                        id,
                        number,
                        payload,
                        inner.clock.now(),
                    ));
                    state.entries.insert(id, entry);
                    inner.publish_metrics(&state);
                }
                Err(err) => {
                    warn!(dispatch_id = %id, error = %err, "Rejected invalid destination");
                    state.entries.insert(id, entry);
                    inner.finalize(
                        &mut state,
                        id,
                        DeliveryState::InvalidNumber,
                        Some((error_codes::TRACKER_FAILURE, err.to_string())),
                        None,
                    );
                    return id;
                }
            }
        }

        Arc::clone(inner).dispatch(id, 0).await;
        id
    }

    /// 取消某个请求的关联任务与待执行的重试，未结束的请求记为失败
    pub async fn cancel(&self, id: DispatchId) -> bool {
        let mut state = self.inner.state.lock().await;
        if !state.entries.contains_key(&id) {
            return false;
        }

        info!(dispatch_id = %id, "Cancelling dispatch");
        self.inner.finalize(
            &mut state,
            id,
            DeliveryState::Failed,
            Some((error_codes::TRACKER_FAILURE, CANCELLED_MESSAGE.to_owned())),
            Some(OutcomeBucket::Failed),
        );
        true
    }

    /// 停止所有待执行任务并释放通道，释放失败只记录日志
    pub async fn cleanup(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                debug!("Dispatch tracker already cleaned up");
                return;
            }
            state.closed = true;
        }

        self.inner.scheduler.cancel_all();
        self.inner.root.cancel();

        if let Err(err) = self.inner.transport.release().await {
            warn!(error = %err, "Failed to release transport, ignoring");
        }

        info!("Dispatch tracker cleaned up");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryStatus> {
        self.inner.statuses.subscribe()
    }

    pub fn subscribe_to(&self, id: DispatchId) -> StatusStream {
        StatusStream::new(self.inner.statuses.subscribe(), id)
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<AggregateMetrics> {
        self.inner.metrics_tx.subscribe()
    }

    pub fn metrics(&self) -> AggregateMetrics {
        *self.inner.metrics_tx.borrow()
    }

    /// 最新状态；已结束的请求在结束记录被淘汰后返回 `None`
    pub async fn status(&self, id: DispatchId) -> Option<DeliveryStatus> {
        let state = self.inner.state.lock().await;
        match state.entries.get(&id) {
            Some(entry) => entry.status.clone(),
            None => state.settled.get(&id).cloned(),
        }
    }

    /// 请求是否已结束（不会再有状态变化），只在结束记录的保留窗口内可查
    pub async fn is_settled(&self, id: DispatchId) -> bool {
        let state = self.inner.state.lock().await;
        state.settled.get(&id).is_some()
    }

    /// 未结束请求当前的重试次数
    pub async fn pending_retries(&self, id: DispatchId) -> Option<u32> {
        let state = self.inner.state.lock().await;
        state.entries.get(&id).map(|entry| entry.retries.attempts())
    }

    /// 尚未结束的请求数
    pub async fn active_dispatches(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }
}

impl TrackerInner {
    fn prerequisites_met(&self) -> bool {
        if !self.service_state.sim_ready() {
            warn!("SIM card not ready");
            return false;
        }
        if !self.service_state.network_registered() {
            warn!("Not registered on a cellular network");
            return false;
        }
        true
    }

    /// 发送（或重发）某个请求的当前批次
    fn dispatch(self: Arc<Self>, id: DispatchId, generation: u32) -> BoxFuture<'static, ()> {
        async move {
            if generation > 0 && !self.prerequisites_met() {
                let mut state = self.state.lock().await;
                if !state.closed {
                    self.handle_send_result(&mut state, id, generation, SendResultCode::NoService);
                }
                return;
            }

            let (destination, segments) = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return;
                }
                let Some(entry) = state.entries.get(&id) else {
                    return;
                };
                if !entry.is_current(generation) {
                    debug!(dispatch_id = %id, generation, "Skipping stale dispatch");
                    return;
                }
                let Some(request) = entry.request.as_ref() else {
                    return;
                };
                let destination = request.destination.as_str().to_owned();
                let segments =
                    request.segments(self.single_segment_limit, self.multipart_segment_len);

                self.transition(&mut state, id, DeliveryState::Sending, None);
                (destination, segments)
            };

            debug!(
                dispatch_id = %id,
                generation,
                segments = segments.len(),
                "Handing message to transport"
            );
            let result = match segments.as_slice() {
                [single] => self
                    .transport
                    .send_single(&destination, single)
                    .await
                    .map(|receipt| vec![receipt]),
                parts => self.transport.send_multipart(&destination, parts).await,
            };

            let mut state = self.state.lock().await;
            match result {
                Ok(receipts) if receipts.is_empty() => {
                    warn!(dispatch_id = %id, "Transport returned no receipts");
                    self.handle_failure(
                        &mut state,
                        id,
                        generation,
                        FailureClass::Generic {
                            code: error_codes::GENERIC_FAILURE,
                            reason: "transport returned no receipts".to_owned(),
                        },
                    );
                }
                Ok(receipts) => {
                    if state.closed {
                        return;
                    }
                    let token = self.root.child_token();
                    let Some(entry) = state.entries.get_mut(&id) else {
                        return;
                    };
                    if !entry.is_current(generation) {
                        return;
                    }
                    entry.segments = receipts.len();
                    entry.sent_segments = 0;
                    entry.delivered_segments = 0;
                    entry.correlation = Some(token.clone());
                    drop(state);

                    tokio::spawn(Arc::clone(&self).correlate(id, generation, receipts, token));
                }
                Err(err) => {
                    warn!(dispatch_id = %id, error = %err, "Transport call failed");
                    self.handle_failure(
                        &mut state,
                        id,
                        generation,
                        FailureClass::Generic {
                            code: error_codes::GENERIC_FAILURE,
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }
        .boxed()
    }

    /// 等待本批次所有分段的发送结果与送达回执
    async fn correlate(
        self: Arc<Self>,
        id: DispatchId,
        generation: u32,
        receipts: Vec<SegmentReceipt>,
        token: CancellationToken,
    ) {
        let mut signals: FuturesUnordered<BoxFuture<'static, Signal>> = FuturesUnordered::new();
        for SegmentReceipt { sent, delivered } in receipts {
            signals.push(
                async move {
                    match sent.await {
                        Ok(code) => Signal::Sent(code),
                        Err(_) => Signal::SentDropped,
                    }
                }
                .boxed(),
            );
            signals.push(
                async move {
                    match delivered.await {
                        Ok(report) => Signal::Delivered(report),
                        Err(_) => Signal::NoReport,
                    }
                }
                .boxed(),
            );
        }

        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => {
                    debug!(dispatch_id = %id, generation, "Correlation stopped");
                    break;
                }
                next = signals.next() => match next {
                    Some(signal) => signal,
                    None => break,
                },
            };

            let mut state = self.state.lock().await;
            match signal {
                Signal::Sent(code) => self.handle_send_result(&mut state, id, generation, code),
                Signal::SentDropped => {
                    warn!(dispatch_id = %id, "Transport dropped send result");
                    self.handle_send_result(
                        &mut state,
                        id,
                        generation,
                        SendResultCode::GenericFailure,
                    );
                }
                Signal::Delivered(report) => {
                    self.handle_delivery_report(&mut state, id, generation, report)
                }
                Signal::NoReport => {
                    debug!(dispatch_id = %id, "No delivery report will arrive for segment");
                }
            }
        }
    }

    fn handle_send_result(
        self: &Arc<Self>,
        state: &mut TrackerState,
        id: DispatchId,
        generation: u32,
        code: SendResultCode,
    ) {
        let Some(entry) = state.entries.get_mut(&id) else {
            debug!(dispatch_id = %id, "Send result for settled or unknown dispatch");
            return;
        };
        if !entry.is_current(generation) {
            debug!(dispatch_id = %id, generation, "Ignoring stale send result");
            return;
        }

        match code {
            SendResultCode::Ok => {
                entry.sent_segments += 1;
                let all_sent = entry.sent_segments >= entry.segments;
                if all_sent && entry.state() == Some(DeliveryState::Sending) {
                    self.transition(state, id, DeliveryState::Sent, None);
                }
            }
            SendResultCode::NoService => {
                self.handle_failure(state, id, generation, FailureClass::NoService)
            }
            SendResultCode::RadioOff => {
                self.handle_failure(state, id, generation, FailureClass::NetworkError)
            }
            other => self.handle_failure(
                state,
                id,
                generation,
                FailureClass::Generic {
                    code: other.error_code().unwrap_or(error_codes::GENERIC_FAILURE),
                    reason: format!("transport reported {:?}", other),
                },
            ),
        }
    }

    fn handle_delivery_report(
        &self,
        state: &mut TrackerState,
        id: DispatchId,
        generation: u32,
        report: DeliveryReport,
    ) {
        let Some(entry) = state.entries.get_mut(&id) else {
            debug!(dispatch_id = %id, "Delivery report for settled or unknown dispatch");
            return;
        };
        if !entry.is_current(generation) {
            debug!(dispatch_id = %id, generation, "Ignoring stale delivery report");
            return;
        }

        match report {
            DeliveryReport::Ok => {
                entry.delivered_segments += 1;
                if entry.delivered_segments >= entry.segments {
                    self.finalize(
                        state,
                        id,
                        DeliveryState::Delivered,
                        None,
                        Some(OutcomeBucket::Delivered),
                    );
                }
            }
            DeliveryReport::Canceled => self.finalize(
                state,
                id,
                DeliveryState::Failed,
                Some((
                    error_codes::TRACKER_FAILURE,
                    DELIVERY_NOT_CONFIRMED_MESSAGE.to_owned(),
                )),
                Some(OutcomeBucket::Failed),
            ),
        }
    }

    /// 失败处理：仍有重试预算时按退避安排重发，否则结束请求
    fn handle_failure(
        self: &Arc<Self>,
        state: &mut TrackerState,
        id: DispatchId,
        generation: u32,
        class: FailureClass,
    ) {
        let retry = {
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            if !entry.is_current(generation) {
                return;
            }
            if let Some(token) = entry.correlation.take() {
                token.cancel();
            }
            match entry.retries.record_attempt() {
                Ok(index) => {
                    entry.generation += 1;
                    Some((index, entry.generation))
                }
                Err(_) => None,
            }
        };

        if let FailureClass::Generic { code, reason } = &class {
            warn!(dispatch_id = %id, code, reason = %reason, "Send attempt failed");
        }

        let Some((index, next_generation)) = retry else {
            warn!(
                dispatch_id = %id,
                max_attempts = self.policy.max_attempts,
                "Retry budget exhausted"
            );
            match class {
                FailureClass::Generic { .. } => self.finalize(
                    state,
                    id,
                    DeliveryState::Failed,
                    Some((
                        error_codes::TRACKER_FAILURE,
                        format!("Message failed after {} attempts", self.policy.max_attempts),
                    )),
                    Some(OutcomeBucket::Failed),
                ),
                FailureClass::NoService => self.finalize(
                    state,
                    id,
                    DeliveryState::NoService,
                    Some((error_codes::NO_SERVICE, NO_SERVICE_MESSAGE.to_owned())),
                    None,
                ),
                FailureClass::NetworkError => self.finalize(
                    state,
                    id,
                    DeliveryState::NetworkError,
                    Some((error_codes::RADIO_OFF, NETWORK_ERROR_MESSAGE.to_owned())),
                    Some(OutcomeBucket::NetworkError),
                ),
            }
            return;
        };

        state.retry_attempts += 1;
        match class {
            FailureClass::NoService => self.transition(
                state,
                id,
                DeliveryState::NoService,
                Some((error_codes::NO_SERVICE, NO_SERVICE_MESSAGE.to_owned())),
            ),
            FailureClass::NetworkError => self.transition(
                state,
                id,
                DeliveryState::NetworkError,
                Some((error_codes::RADIO_OFF, NETWORK_ERROR_MESSAGE.to_owned())),
            ),
            FailureClass::Generic { .. } => {}
        }

        let delay = self.policy.backoff.delay_at(index);
        info!(
            dispatch_id = %id,
            attempt = index + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        self.publish_metrics(state);
        let task = Arc::clone(self).dispatch(id, next_generation);
        self.scheduler.schedule(id, delay, task);
    }

    /// 以最后一条状态结束请求：移出活动表、停止关联与重试、计入统计
    fn finalize(
        &self,
        state: &mut TrackerState,
        id: DispatchId,
        new_state: DeliveryState,
        detail: StatusDetail,
        bucket: Option<OutcomeBucket>,
    ) {
        let Some(mut entry) = state.entries.remove(&id) else {
            return;
        };
        if let Some(token) = entry.correlation.take() {
            token.cancel();
        }
        self.scheduler.cancel(id);
        state.retry_attempts = state
            .retry_attempts
            .saturating_sub(u64::from(entry.retries.attempts()));

        let status = self.build_status(&entry, id, new_state, detail).with_settled(true);
        let delivery_time = entry
            .request
            .as_ref()
            .and_then(|request| (status.timestamp - request.created_at).to_std().ok());

        info!(
            dispatch_id = %id,
            state = new_state.as_str(),
            error_code = ?status.error_code,
            "Dispatch settled"
        );
        state.settled.record(status.clone());
        self.statuses.publish(status);

        if let Some(bucket) = bucket {
            state.metrics.record_outcome(bucket, delivery_time);
        }
        self.publish_metrics(state);
    }

    fn transition(
        &self,
        state: &mut TrackerState,
        id: DispatchId,
        new_state: DeliveryState,
        detail: StatusDetail,
    ) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };

        let status = self.build_status(entry, id, new_state, detail);
        info!(
            dispatch_id = %id,
            state = new_state.as_str(),
            error_code = ?status.error_code,
            "Delivery status changed"
        );
        entry.status = Some(status.clone());
        self.statuses.publish(status);
    }

    fn build_status(
        &self,
        entry: &DispatchEntry,
        id: DispatchId,
        new_state: DeliveryState,
        detail: StatusDetail,
    ) -> DeliveryStatus {
        let status =
            DeliveryStatus::new(id, entry.destination.clone(), new_state, self.clock.now());
        match detail {
            Some((code, message)) => status.with_error(code, message),
            None => status,
        }
    }

    fn publish_metrics(&self, state: &TrackerState) {
        self.metrics_tx
            .send_replace(state.metrics.snapshot(state.retry_attempts));
    }
}
