use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 一次发送请求的唯一标识，重试期间保持不变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(pub Uuid);

impl DispatchId {
    /// 为新的发送请求生成随机标识
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DispatchId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<DispatchId> for Uuid {
    fn from(value: DispatchId) -> Self {
        value.0
    }
}

/// 经过验证的目标号码（已去除空白字符）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub const MIN_LEN: usize = 10;
    pub const MAX_LEN: usize = 15;

    pub fn parse(value: impl AsRef<str>) -> Result<Self, DomainError> {
        let cleaned: String = value
            .as_ref()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        if cleaned.len() < Self::MIN_LEN {
            return Err(DomainError::validation_error(
                "destination",
                format!("must contain at least {} characters", Self::MIN_LEN),
            ));
        }
        if cleaned.len() > Self::MAX_LEN {
            return Err(DomainError::validation_error(
                "destination",
                format!("must contain at most {} characters", Self::MAX_LEN),
            ));
        }
        if !is_global_phone_number(&cleaned) {
            return Err(DomainError::validation_error(
                "destination",
                "not a global phone number",
            ));
        }

        Ok(Self(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 全局号码格式：可选的 `+` 前缀，其后只能是数字、`.` 或 `-`。
fn is_global_phone_number(value: &str) -> bool {
    let body = value.strip_prefix('+').unwrap_or(value);
    !body.is_empty()
        && body.chars().any(|c| c.is_ascii_digit())
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}
