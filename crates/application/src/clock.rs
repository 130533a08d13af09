use chrono::Utc;
use domain::Timestamp;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// 跟随 tokio 运行时时间推进的时钟。
///
/// 在 `tokio::time::pause()` 下时间只随 `advance`/休眠前进，
/// 测试中的时间戳因此是确定的。
#[derive(Debug)]
pub struct TokioClock {
    origin_wall: Timestamp,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin_wall: Timestamp) -> Self {
        Self {
            origin_wall,
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.origin_wall + elapsed,
            Err(_) => self.origin_wall,
        }
    }
}
