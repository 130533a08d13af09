use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 默认的最大重试次数
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// 单个发送请求的重试计数，从 0 开始，不超过上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounter {
    attempts: u32,
    max_attempts: u32,
}

impl RetryCounter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    /// 已经安排过的重试次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// 记录一次重试，返回本次重试的序号（从 0 开始，用于计算退避时间）
    pub fn record_attempt(&mut self) -> Result<u32, DomainError> {
        if !self.can_retry() {
            return Err(DomainError::RetryBudgetExhausted {
                attempts: self.attempts,
            });
        }
        let index = self.attempts;
        self.attempts += 1;
        Ok(index)
    }
}

impl Default for RetryCounter {
    fn default() -> Self {
        Self::new(MAX_RETRY_ATTEMPTS)
    }
}
