use serde::{Deserialize, Serialize};

use crate::value_objects::{DispatchId, PhoneNumber, Timestamp};

/// 单条短信允许的最大字符数
pub const SINGLE_SEGMENT_LIMIT: usize = 160;

/// 长短信拆分后每段的字符数（需预留拼接头）
pub const MULTIPART_SEGMENT_LEN: usize = 153;

/// 一次发送请求，创建后不可变，重试时原样重发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub id: DispatchId,
    pub destination: PhoneNumber,
    pub payload: String,
    pub created_at: Timestamp,
}

impl DispatchRequest {
    pub fn new(
        id: DispatchId,
        destination: PhoneNumber,
        payload: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            destination,
            payload: payload.into(),
            created_at,
        }
    }

    /// 按照给定的阈值拆分消息正文
    pub fn segments(&self, single_limit: usize, segment_len: usize) -> Vec<String> {
        split_segments(&self.payload, single_limit, segment_len)
    }
}

/// 拆分消息正文。
///
/// 不超过 `single_limit` 个字符时原样返回单段；否则按 `segment_len`
/// 个字符切分。按字符而非字节计数，避免截断多字节字符。
pub fn split_segments(payload: &str, single_limit: usize, segment_len: usize) -> Vec<String> {
    if payload.chars().count() <= single_limit {
        return vec![payload.to_owned()];
    }

    let segment_len = segment_len.max(1);
    let chars: Vec<char> = payload.chars().collect();
    chars
        .chunks(segment_len)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
