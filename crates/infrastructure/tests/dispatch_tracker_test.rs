use std::sync::Arc;
use std::time::Duration;

use application::{
    DeliveryReport, DispatchHistory, DispatchTracker, SendResultCode, TokioClock,
    TrackerDependencies,
};
use config::DispatchConfig;
use domain::{DeliveryState, DeliveryStatus, DispatchId};
use infrastructure::{CallScript, SegmentOutcome, SimulatedTransport, StaticServiceState};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, timeout};

const DESTINATION: &str = "+1 555 123 4567";

fn build_tracker(
    transport: &Arc<SimulatedTransport>,
    service: &Arc<StaticServiceState>,
) -> DispatchTracker {
    DispatchTracker::new(TrackerDependencies {
        transport: transport.clone(),
        service_state: service.clone(),
        clock: Arc::new(TokioClock::new()),
        config: DispatchConfig::default(),
    })
    .expect("default config is valid")
}

async fn wait_settled(tracker: &DispatchTracker, id: DispatchId) {
    timeout(Duration::from_secs(120), async {
        while !tracker.is_settled(id).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dispatch did not settle");
}

fn drain(rx: &mut broadcast::Receiver<DeliveryStatus>) -> Vec<DeliveryStatus> {
    let mut statuses = Vec::new();
    while let Ok(status) = rx.try_recv() {
        statuses.push(status);
    }
    statuses
}

fn states(statuses: &[DeliveryStatus]) -> Vec<DeliveryState> {
    statuses.iter().map(|s| s.state).collect()
}

fn gap(transport: &SimulatedTransport, from: usize, to: usize) -> Duration {
    let calls = transport.calls();
    calls[to].at.duration_since(calls[from].at)
}

fn assert_gap(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(50),
        "expected gap of {:?}, got {:?}",
        expected,
        actual
    );
}

#[tokio::test(start_paused = true)]
async fn healthy_send_is_delivered() {
    let transport = Arc::new(SimulatedTransport::new().with_latency(Duration::from_millis(100)));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "Hello there").await;
    wait_settled(&tracker, id).await;

    let statuses = drain(&mut rx);
    assert_eq!(
        states(&statuses),
        vec![
            DeliveryState::Sending,
            DeliveryState::Sent,
            DeliveryState::Delivered
        ]
    );
    assert!(statuses.iter().all(|s| s.dispatch_id == id));
    assert!(statuses.iter().all(|s| s.destination == DESTINATION));
    assert!(statuses.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_messages_sent, 1);
    assert_eq!(metrics.successful_deliveries, 1);
    assert_eq!(metrics.failed_deliveries, 0);
    assert_eq!(metrics.retry_attempts, 0);
    assert!((200..=210).contains(&metrics.average_delivery_time_ms));

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].destination, "+15551234567");
}

#[tokio::test(start_paused = true)]
async fn sim_not_ready_reports_no_service() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::new(false, true));
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;

    let statuses = drain(&mut rx);
    assert_eq!(states(&statuses), vec![DeliveryState::NoService]);
    assert_eq!(statuses[0].error_code, Some(4));
    assert_eq!(
        statuses[0].error_message.as_deref(),
        Some("No cellular service available")
    );
    assert_eq!(transport.call_count(), 0);
    assert_eq!(tracker.metrics().total_messages_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn unregistered_network_reports_no_service() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::new(true, false));
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;

    assert_eq!(states(&drain(&mut rx)), vec![DeliveryState::NoService]);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_number_is_rejected_without_dispatch() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit("555-1234", "hi").await;
    wait_settled(&tracker, id).await;

    let statuses = drain(&mut rx);
    assert_eq!(states(&statuses), vec![DeliveryState::InvalidNumber]);
    assert_eq!(statuses[0].error_code, Some(-1));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn generic_failures_back_off_then_fail() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Complete(
        SegmentOutcome::failed(SendResultCode::GenericFailure),
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "retry me").await;
    wait_settled(&tracker, id).await;

    assert_eq!(transport.call_count(), 4);
    assert_gap(gap(&transport, 0, 1), Duration::from_secs(2));
    assert_gap(gap(&transport, 1, 2), Duration::from_secs(4));
    assert_gap(gap(&transport, 2, 3), Duration::from_secs(8));

    let statuses = drain(&mut rx);
    assert_eq!(
        states(&statuses),
        vec![
            DeliveryState::Sending,
            DeliveryState::Sending,
            DeliveryState::Sending,
            DeliveryState::Sending,
            DeliveryState::Failed
        ]
    );
    let last = statuses.last().unwrap();
    assert_eq!(last.error_code, Some(-1));
    assert_eq!(
        last.error_message.as_deref(),
        Some("Message failed after 3 attempts")
    );

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_messages_sent, 1);
    assert_eq!(metrics.failed_deliveries, 1);
    assert_eq!(metrics.retry_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_count_is_visible_while_pending() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Reject(
        "modem busy".into(),
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);

    let id = tracker.submit(DESTINATION, "hi").await;
    assert_eq!(tracker.pending_retries(id).await, Some(1));
    assert_eq!(tracker.metrics().retry_attempts, 1);

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(transport.call_count(), 2);
    assert_eq!(tracker.pending_retries(id).await, Some(2));

    wait_settled(&tracker, id).await;
    assert_eq!(tracker.pending_retries(id).await, None);
    assert_eq!(tracker.metrics().retry_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failure() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.push_script(CallScript::Reject("modem busy".into()));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "second time lucky").await;
    wait_settled(&tracker, id).await;

    assert_eq!(transport.call_count(), 2);
    assert_eq!(transport.calls()[1].segments, vec!["second time lucky".to_owned()]);
    assert_eq!(
        drain(&mut rx).last().map(|s| s.state),
        Some(DeliveryState::Delivered)
    );

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_messages_sent, 1);
    assert_eq!(metrics.successful_deliveries, 1);
    assert_eq!(metrics.retry_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn no_service_result_is_retried_then_settles() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Complete(
        SegmentOutcome::failed(SendResultCode::NoService),
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;

    assert_eq!(transport.call_count(), 4);
    let statuses = drain(&mut rx);
    let no_service = statuses
        .iter()
        .filter(|s| s.state == DeliveryState::NoService)
        .count();
    assert_eq!(no_service, 4);
    assert_eq!(statuses.last().map(|s| s.state), Some(DeliveryState::NoService));

    let metrics = tracker.metrics();
    assert_eq!(metrics.settled_total(), 0);
    assert_eq!(metrics.total_messages_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn no_status_follows_the_final_one() {
    let transport = Arc::new(SimulatedTransport::new().with_latency(Duration::from_millis(100)));
    transport.push_script(CallScript::Complete(SegmentOutcome::failed(
        SendResultCode::NoService,
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;
    sleep(Duration::from_secs(30)).await;

    let statuses = drain(&mut rx);
    let flags: Vec<_> = statuses.iter().map(|s| (s.state, s.is_final())).collect();
    assert_eq!(
        flags,
        vec![
            (DeliveryState::Sending, false),
            (DeliveryState::NoService, false),
            (DeliveryState::Sending, false),
            (DeliveryState::Sent, false),
            (DeliveryState::Delivered, true),
        ]
    );
    let final_at = statuses.iter().position(|s| s.is_final()).unwrap();
    assert_eq!(final_at, statuses.len() - 1);
}

#[tokio::test(start_paused = true)]
async fn radio_off_is_counted_as_network_error() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Complete(
        SegmentOutcome::failed(SendResultCode::RadioOff),
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;

    let statuses = drain(&mut rx);
    let last = statuses.last().unwrap();
    assert_eq!(last.state, DeliveryState::NetworkError);
    assert_eq!(last.error_code, Some(2));
    assert_eq!(last.error_message.as_deref(), Some("Network error occurred"));

    let metrics = tracker.metrics();
    assert_eq!(metrics.network_errors, 1);
    assert_eq!(metrics.failed_deliveries, 0);
}

#[tokio::test(start_paused = true)]
async fn lost_service_during_backoff_stops_dispatching() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.push_script(CallScript::Reject("modem busy".into()));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    service.set_sim_ready(false);
    wait_settled(&tracker, id).await;

    assert_eq!(transport.call_count(), 1);
    let statuses = drain(&mut rx);
    assert_eq!(statuses.last().map(|s| s.state), Some(DeliveryState::NoService));
}

#[tokio::test(start_paused = true)]
async fn multipart_waits_for_every_segment() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Hold));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let payload = "x".repeat(400);
    let id = tracker.submit(DESTINATION, &payload).await;
    assert_eq!(rx.recv().await.unwrap().state, DeliveryState::Sending);

    let calls = transport.calls();
    assert_eq!(calls[0].segments.len(), 3);
    assert_eq!(calls[0].segments.concat(), payload);

    let mut held = transport.take_held();
    assert_eq!(held.len(), 3);

    held[0].report_sent(SendResultCode::Ok);
    held[2].report_sent(SendResultCode::Ok);
    assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());

    held[1].report_sent(SendResultCode::Ok);
    assert_eq!(rx.recv().await.unwrap().state, DeliveryState::Sent);

    held[2].report_delivery(DeliveryReport::Ok);
    held[0].report_delivery(DeliveryReport::Ok);
    assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());
    assert!(!tracker.is_settled(id).await);

    held[1].report_delivery(DeliveryReport::Ok);
    assert_eq!(rx.recv().await.unwrap().state, DeliveryState::Delivered);
    assert_eq!(tracker.metrics().successful_deliveries, 1);
}

#[tokio::test(start_paused = true)]
async fn delivery_report_before_send_result_is_accepted() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Hold));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    let mut held = transport.take_held();

    held[0].report_delivery(DeliveryReport::Ok);
    wait_settled(&tracker, id).await;
    held[0].report_sent(SendResultCode::Ok);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        states(&drain(&mut rx)),
        vec![DeliveryState::Sending, DeliveryState::Delivered]
    );
    assert_eq!(tracker.metrics().successful_deliveries, 1);
}

#[tokio::test(start_paused = true)]
async fn canceled_delivery_report_fails_dispatch() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Complete(
        SegmentOutcome {
            sent: SendResultCode::Ok,
            delivery: Some(DeliveryReport::Canceled),
        },
    )));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    wait_settled(&tracker, id).await;

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.state, DeliveryState::Failed);
    assert_eq!(
        last.error_message.as_deref(),
        Some("Delivery confirmation not received")
    );
    assert_eq!(tracker.metrics().failed_deliveries, 1);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_pending_dispatch() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Hold));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let id = tracker.submit(DESTINATION, "hi").await;
    let mut held = transport.take_held();

    assert!(tracker.cancel(id).await);
    assert!(!tracker.cancel(id).await);

    held[0].report_sent(SendResultCode::Ok);
    held[0].report_delivery(DeliveryReport::Ok);
    sleep(Duration::from_millis(50)).await;

    let statuses = drain(&mut rx);
    assert_eq!(
        states(&statuses),
        vec![DeliveryState::Sending, DeliveryState::Failed]
    );
    assert_eq!(
        statuses[1].error_message.as_deref(),
        Some("Dispatch cancelled")
    );
    assert_eq!(tracker.metrics().failed_deliveries, 1);
    assert_eq!(tracker.metrics().successful_deliveries, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_unknown_dispatch_is_noop() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);

    assert!(!tracker.cancel(DispatchId::generate()).await);
}

#[tokio::test(start_paused = true)]
async fn total_sent_counts_every_submit() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(tracker.submit(DESTINATION, &format!("message {}", i)).await);
    }
    for id in &ids {
        wait_settled(&tracker, *id).await;
    }

    let metrics = tracker.metrics();
    assert_eq!(metrics.total_messages_sent, 5);
    assert_eq!(metrics.successful_deliveries, 5);
    assert_eq!(transport.call_count(), 5);
    assert_eq!(tracker.active_dispatches().await, 0);
}

#[tokio::test(start_paused = true)]
async fn settled_dispatches_do_not_accumulate() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);

    for _ in 0..5000 {
        tracker.submit("123", "hi").await;
    }

    assert_eq!(tracker.active_dispatches().await, 0);
    assert_eq!(tracker.metrics().total_messages_sent, 5000);
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn settled_outcomes_never_exceed_total_sent() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut metrics_rx = tracker.subscribe_metrics();

    // 送达
    let id = tracker.submit(DESTINATION, "one").await;
    wait_settled(&tracker, id).await;

    // 重试耗尽后失败
    for _ in 0..4 {
        transport.push_script(CallScript::Reject("modem busy".into()));
    }
    let id = tracker.submit(DESTINATION, "two").await;
    wait_settled(&tracker, id).await;

    // 网络错误
    for _ in 0..4 {
        transport.push_script(CallScript::Complete(SegmentOutcome::failed(
            SendResultCode::RadioOff,
        )));
    }
    let id = tracker.submit(DESTINATION, "three").await;
    wait_settled(&tracker, id).await;

    let id = tracker.submit("12", "four").await;
    wait_settled(&tracker, id).await;

    service.set_network_registered(false);
    let id = tracker.submit(DESTINATION, "five").await;
    wait_settled(&tracker, id).await;

    assert!(metrics_rx.has_changed().unwrap());
    let metrics = *metrics_rx.borrow_and_update();
    assert_eq!(metrics, tracker.metrics());
    assert_eq!(metrics.total_messages_sent, 5);
    assert_eq!(metrics.successful_deliveries, 1);
    assert_eq!(metrics.failed_deliveries, 1);
    assert_eq!(metrics.network_errors, 1);
    assert_eq!(metrics.retry_attempts, 0);
    assert!(metrics.settled_total() <= metrics.total_messages_sent);
}

#[tokio::test(start_paused = true)]
async fn subscribe_to_filters_other_dispatches() {
    let transport = Arc::new(SimulatedTransport::with_default(CallScript::Hold));
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);

    let first = tracker.submit(DESTINATION, "first").await;
    let mut held = transport.take_held();
    let mut stream = tracker.subscribe_to(first);

    let _second = tracker.submit(DESTINATION, "second").await;
    held[0].report_sent(SendResultCode::Ok);

    let status = timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.dispatch_id, first);
    assert_eq!(status.state, DeliveryState::Sent);
}

#[tokio::test(start_paused = true)]
async fn cleanup_cancels_retries_and_releases_once() {
    let transport = Arc::new(
        SimulatedTransport::with_default(CallScript::Reject("modem busy".into()))
            .with_failing_release(),
    );
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let mut rx = tracker.subscribe();

    let pending = tracker.submit(DESTINATION, "hi").await;
    assert_eq!(tracker.pending_retries(pending).await, Some(1));

    tracker.cleanup().await;
    tracker.cleanup().await;
    assert_eq!(transport.release_count(), 1);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.call_count(), 1);

    let after = tracker.submit(DESTINATION, "too late").await;
    let statuses = drain(&mut rx);
    let last = statuses.last().unwrap();
    assert_eq!(last.dispatch_id, after);
    assert_eq!(last.state, DeliveryState::NoService);
}

#[tokio::test(start_paused = true)]
async fn history_projection_follows_status_stream() {
    let transport = Arc::new(SimulatedTransport::new());
    let service = Arc::new(StaticServiceState::ready());
    let tracker = build_tracker(&transport, &service);
    let history = Arc::new(RwLock::new(DispatchHistory::new()));
    tokio::spawn(DispatchHistory::follow(
        Arc::clone(&history),
        tracker.subscribe(),
    ));

    let first = tracker.submit(DESTINATION, "first").await;
    wait_settled(&tracker, first).await;
    let second = tracker.submit("123", "second").await;
    wait_settled(&tracker, second).await;

    timeout(Duration::from_secs(5), async {
        loop {
            let caught_up = {
                let history = history.read().await;
                [first, second]
                    .iter()
                    .all(|id| history.get(*id).is_some_and(|entry| entry.settled))
            };
            if caught_up {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("history did not catch up");

    let mut history = history.write().await;
    history.attach_content(first, "first").unwrap();

    let entries = history.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, second);
    assert_eq!(entries[0].state, DeliveryState::InvalidNumber);
    assert_eq!(entries[1].id, first);
    assert_eq!(entries[1].state, DeliveryState::Delivered);
    assert_eq!(entries[1].content, "first");
}
