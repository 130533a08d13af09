//! 统一配置中心
//!
//! 提供短信发送追踪器的配置管理，包括：
//! - 重试次数与退避基数
//! - 长短信拆分阈值
//! - 状态广播通道容量
//! - 已结束请求的状态保留条数

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// 指定配置文件路径的环境变量
pub const CONFIG_FILE_ENV: &str = "DISPATCH_CONFIG_FILE";

/// 环境变量前缀
pub const ENV_PREFIX: &str = "DISPATCH_";

/// 发送追踪器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    /// 每个请求最多重试次数
    #[validate(range(max = 10))]
    pub max_retry_attempts: u32,
    /// 退避基数（毫秒），第 n 次重试等待 base * 2^n
    #[validate(range(min = 1))]
    pub base_retry_delay_ms: u64,
    /// 单条短信最大字符数，超过则拆分
    #[validate(range(min = 1))]
    pub single_segment_limit: usize,
    /// 拆分后每段字符数
    #[validate(range(min = 1))]
    pub multipart_segment_len: usize,
    /// 状态广播通道容量
    #[validate(range(min = 1))]
    pub status_channel_capacity: usize,
    /// 已结束请求保留最后状态的条数，超出后最早的被淘汰
    #[validate(range(min = 1))]
    pub settled_retention: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_retry_delay_ms: 2000,
            single_segment_limit: 160,
            multipart_segment_len: 153,
            status_channel_capacity: 256,
            settled_retention: 1024,
        }
    }
}

impl DispatchConfig {
    /// 加载顺序：默认值 -> 可选配置文件 (DISPATCH_CONFIG_FILE) -> 环境变量 (DISPATCH_*)
    pub fn load() -> Result<Self, ConfigError> {
        let mut fig = Figment::new().merge(Serialized::defaults(DispatchConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig = fig.merge(Env::prefixed(ENV_PREFIX).ignore(&["config_file"]));

        Self::extract(fig)
    }

    /// 从 TOML 字符串解析，未给出的字段使用默认值
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let fig = Figment::new()
            .merge(Serialized::defaults(DispatchConfig::default()))
            .merge(Toml::string(s));
        Self::extract(fig)
    }

    fn extract(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: DispatchConfig = fig
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// 校验字段范围及字段之间的约束
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.multipart_segment_len > self.single_segment_limit {
            return Err(ConfigError::Invalid(format!(
                "multipart_segment_len ({}) cannot exceed single_segment_limit ({})",
                self.multipart_segment_len, self.single_segment_limit
            )));
        }

        Ok(())
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}
