//! 读写器与帧枚举的配置项。
//!
//! 三个结构都遵循同一构造风格：`new()` 给出默认值，`with_*` 链式覆盖，访问器只读。
//! 启用 `serde` 特性后可由宿主直接从自身配置文件反序列化。

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 默认的单次底层读取提示（字节）。
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// 默认的单帧上限（字节）。
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// 缓冲读取器配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“每次向底层流要多少字节”显式配置化：过小导致系统调用过多，过大浪费内存；
/// - 预分配容量让已知帧长的场景避免早期扩容。
///
/// ## 契约说明（What）
/// - `chunk_size`：单次底层读取的上限提示，`0` 会被提升为 `1`；受限读取器还会把它截断到剩余预算；
/// - `initial_capacity`：构造时为缓冲预留的字节数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReaderOptions {
    chunk_size: usize,
    initial_capacity: usize,
}

impl ReaderOptions {
    pub const fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_capacity: 0,
        }
    }

    /// 设置单次底层读取提示。
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 设置初始缓冲容量。
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// 缓冲写入器配置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WriterOptions {
    initial_capacity: usize,
}

impl WriterOptions {
    pub const fn new() -> Self {
        Self {
            initial_capacity: 0,
        }
    }

    /// 设置初始缓冲容量。
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }
}

/// 长度前缀帧枚举配置。
///
/// - **契约 (What)**：`max_frame_len` 限制单帧负载长度，超限的前缀视为损坏输入并以
///   [`StreamError::LimitExceeded`](crate::StreamError::LimitExceeded) 失败，避免恶意前缀触发巨额分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameOptions {
    max_frame_len: usize,
}

impl FrameOptions {
    pub const fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// 设置单帧上限。
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_chunk_size_is_promoted() {
        let options = ReaderOptions::new().with_chunk_size(0);
        assert_eq!(options.chunk_size(), 1);
        assert_eq!(ReaderOptions::default().chunk_size(), DEFAULT_CHUNK_SIZE);
    }
}
