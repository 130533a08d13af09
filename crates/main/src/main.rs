//! 主应用程序入口
//!
//! 通过模拟短信通道发送一条短信，逐行输出状态事件（JSON），
//! 结束后输出发送历史与统计快照。
//!
//! 用法: sms-dispatch <号码> <内容> [--simulate delivered|failure|no-service|radio-off|canceled]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use application::{
    DeliveryReport, DispatchHistory, DispatchTracker, SendResultCode, SystemClock,
    TrackerDependencies,
};
use config::DispatchConfig;
use infrastructure::{CallScript, SegmentOutcome, SimulatedTransport, StaticServiceState};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

const SIMULATED_LATENCY: Duration = Duration::from_millis(300);
const HISTORY_CATCH_UP: Duration = Duration::from_secs(1);

struct Args {
    destination: String,
    message: String,
    outcome: SegmentOutcome,
}

fn parse_outcome(name: &str) -> anyhow::Result<SegmentOutcome> {
    let outcome = match name {
        "delivered" => SegmentOutcome::delivered(),
        "failure" => SegmentOutcome::failed(SendResultCode::GenericFailure),
        "no-service" => SegmentOutcome::failed(SendResultCode::NoService),
        "radio-off" => SegmentOutcome::failed(SendResultCode::RadioOff),
        "canceled" => SegmentOutcome {
            sent: SendResultCode::Ok,
            delivery: Some(DeliveryReport::Canceled),
        },
        other => bail!("unknown simulated outcome: {}", other),
    };
    Ok(outcome)
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut outcome = SegmentOutcome::delivered();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--simulate" {
            let name = args.next().context("--simulate requires an outcome")?;
            outcome = parse_outcome(&name)?;
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let (Some(destination), Some(message)) = (positional.next(), positional.next()) else {
        bail!("usage: sms-dispatch <destination> <message> [--simulate <outcome>]");
    };

    Ok(Args {
        destination,
        message,
        outcome,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;
    let config = DispatchConfig::load()?;
    tracing::info!(
        max_retry_attempts = config.max_retry_attempts,
        base_retry_delay_ms = config.base_retry_delay_ms,
        "Loaded dispatch configuration"
    );

    let transport = Arc::new(
        SimulatedTransport::with_default(CallScript::Complete(args.outcome))
            .with_latency(SIMULATED_LATENCY),
    );

    let tracker = DispatchTracker::new(TrackerDependencies {
        transport,
        service_state: Arc::new(StaticServiceState::ready()),
        clock: Arc::new(SystemClock),
        config,
    })?;

    let history = Arc::new(RwLock::new(DispatchHistory::new()));
    tokio::spawn(DispatchHistory::follow(
        Arc::clone(&history),
        tracker.subscribe(),
    ));

    let mut statuses = tracker.subscribe();
    let id = tracker.submit(&args.destination, &args.message).await;
    tracing::info!(dispatch_id = %id, "Message submitted");

    loop {
        match statuses.recv().await {
            Ok(status) if status.dispatch_id == id => {
                println!("{}", serde_json::to_string(&status)?);
                if status.is_final() {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Status output lagged behind");
                if tracker.is_settled(id).await {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    // 等历史投影消费到最后一条状态
    let caught_up = timeout(HISTORY_CATCH_UP, async {
        loop {
            if history.read().await.get(id).is_some_and(|entry| entry.settled) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if caught_up.is_err() {
        tracing::warn!(dispatch_id = %id, "History did not observe the final status");
    }

    {
        let mut history = history.write().await;
        if let Err(err) = history.attach_content(id, args.message.as_str()) {
            tracing::warn!(error = %err, "Dispatch missing from history");
        }
        println!("{}", serde_json::to_string(history.entries())?);
    }

    println!("{}", serde_json::to_string(&tracker.metrics())?);

    tracker.cleanup().await;
    Ok(())
}
