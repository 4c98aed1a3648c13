//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 缓冲读写器的失败语义：实例忙、流提前结束、取消、底层 IO、字节预算越界与内部不变量破坏；
//! - 以流为后端的枚举需要把这些失败送进枚举引擎，因此提供到 [`EnumerationError`] 的转换。

use spark_enumeration::{Cancellation, EnumerationError};
use thiserror::Error;

use crate::gate::StreamState;

/// 本 crate 统一使用的 `Result` 别名。
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// 缓冲读写器的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：`try_*` 系列以 `bool` 报告“数据不足”，只有严格辅助函数才把它升级为
///   [`StreamError::UnexpectedEnd`]，宽松或严格由调用方选择；
/// - **契约 (What)**：`Busy` 表示单消费者约定被违反（或子读写器仍存活），从不排队或重试；
/// - **设计权衡 (Trade-offs)**：`Io` 直接承载 `std::io::Error`，保留底层错误种类供上层判定。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// 实例正忙于另一个操作，或有存活的子读写器。
    #[error("stream wrapper is busy: `{operation}` rejected while in state {state:?}")]
    Busy {
        operation: &'static str,
        state: StreamState,
    },

    /// 底层流在凑齐请求字节数之前结束。
    #[error("unexpected end of stream: requested {requested} bytes, {available} available")]
    UnexpectedEnd { requested: usize, available: usize },

    /// 操作在下一次底层 IO 前观测到取消信号。
    #[error("stream operation cancelled")]
    Cancelled,

    /// 底层流失败。
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// 请求超出受限读写器的剩余字节预算。
    #[error("byte budget exceeded: requested {requested}, remaining {remaining}")]
    LimitExceeded { requested: u64, remaining: u64 },

    /// 擦除 / 回退的区间不在已交付区域内。
    #[error("range {start}..{end} lies outside the {available} delivered bytes")]
    OutOfRange {
        start: usize,
        end: usize,
        available: usize,
    },

    /// 内部不变量破坏（编程缺陷信号）。
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl StreamError {
    /// 是否为实例忙。
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// 底层 IO 之前的取消检查点。
pub(crate) fn ensure_active(cancel: &Cancellation) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(StreamError::Cancelled);
    }
    Ok(())
}

impl From<StreamError> for EnumerationError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::Cancelled => EnumerationError::Cancelled,
            other => EnumerationError::producer(other),
        }
    }
}
