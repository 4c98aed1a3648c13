//! 取消契约：所有异步枚举与流操作共享的可中断性信号。

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::error::{EnumerationError, Result};

/// 调用方交给枚举器与缓冲流的取消标志。
///
/// 枚举步进在迁移状态之前调用 [`Cancellation::check`]，缓冲流在每次触达底层 IO 之前检查：
/// 标志已置位时操作以 [`EnumerationError::Cancelled`]（流侧为 `StreamError::Cancelled`）
/// 失败，状态机保持原位，不会留下半开的步进。`end` 不看标志，已开始的枚举总能收尾。
///
/// 生产者续延拿到的是 [`Cancellation::child`]，与调用方看到同一个标志。已经挂起的续延
/// 不会被强行中止；长时间等待 IO 的续延应自行查询 [`Cancellation::is_cancelled`]。
///
/// 标志只能从未取消变为已取消，不可复位；需要重新开始时构造新的实例。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
}

impl Cancellation {
    /// 未置位的新标志。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                flag: AtomicBool::new(false),
            }),
        }
    }

    /// 标志是否已置位。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 置位标志；只有真正完成置位的那次调用返回 `true`。
    pub fn cancel(&self) -> bool {
        self.inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 交给生产者续延的句柄，与 `self` 共享标志。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 若已取消则返回 [`EnumerationError::Cancelled`]。
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EnumerationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
