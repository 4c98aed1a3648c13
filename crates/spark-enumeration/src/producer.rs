//! 顺序枚举的生产者契约。
//!
//! ## 契约形态（What）
//! - [`InitialMoveNext`]：每一轮枚举的入口，可被重复调用（`end` 复位后重新开始一轮）；
//!   返回 [`FirstStep`]，即首个 [`Step`] 加上本轮的结束通知；
//! - [`Continuation`]：随每个元素一同返回的一次性续延，调用后得到下一个 [`Step`]；
//! - [`EndNotifier`]：本轮结束时（自然耗尽或提前终止）恰好被调用一次。
//!
//! 所有回调都接收 [`Cancellation`] 的派生令牌，是否尊重取消由生产者自行决定。

use std::{fmt, future::Future, sync::Arc};

use crate::{contract::Cancellation, error::Result, future::BoxFuture};

/// 一次性步进续延。
pub type Continuation<T> =
    Box<dyn FnOnce(Cancellation) -> BoxFuture<'static, Result<Step<T>>> + Send + 'static>;

/// 可重复调用的首次步进入口。
pub type InitialMoveNext<T> =
    Arc<dyn Fn(Cancellation) -> BoxFuture<'static, Result<FirstStep<T>>> + Send + Sync + 'static>;

/// 一轮枚举的结束通知（生产者的释放钩子）。
pub type EndNotifier =
    Box<dyn FnOnce(Cancellation) -> BoxFuture<'static, Result<()>> + Send + 'static>;

/// 单步结果：产出一个元素并附带下一步续延，或报告序列耗尽。
pub enum Step<T> {
    /// 新元素及其后继续延。
    Item { item: T, next: Continuation<T> },
    /// 没有更多元素。
    Exhausted,
}

impl<T> Step<T> {
    /// 以异步闭包构造带续延的元素步。
    pub fn item<F, Fut>(item: T, next: F) -> Self
    where
        F: FnOnce(Cancellation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Step<T>>> + Send + 'static,
    {
        Self::Item {
            item,
            next: continuation(next),
        }
    }

    /// 耗尽步。
    pub fn exhausted() -> Self {
        Self::Exhausted
    }

    /// 是否携带元素。
    pub fn has_item(&self) -> bool {
        matches!(self, Self::Item { .. })
    }
}

impl<T: fmt::Debug> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item { item, .. } => f.debug_struct("Item").field("item", item).finish(),
            Self::Exhausted => f.write_str("Exhausted"),
        }
    }
}

/// 首次步进的结果：首个 [`Step`] 与本轮的结束通知。
pub struct FirstStep<T> {
    pub step: Step<T>,
    pub on_end: Option<EndNotifier>,
}

impl<T> FirstStep<T> {
    /// 不带结束通知的首步。
    pub fn new(step: Step<T>) -> Self {
        Self { step, on_end: None }
    }

    /// 附加结束通知。
    pub fn with_end<F, Fut>(mut self, on_end: F) -> Self
    where
        F: FnOnce(Cancellation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_end = Some(end_notifier(on_end));
        self
    }
}

impl<T> From<Step<T>> for FirstStep<T> {
    fn from(step: Step<T>) -> Self {
        Self::new(step)
    }
}

/// 将异步闭包擦除为 [`Continuation`]。
pub fn continuation<T, F, Fut>(next: F) -> Continuation<T>
where
    F: FnOnce(Cancellation) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Step<T>>> + Send + 'static,
{
    Box::new(move |cancel| Box::pin(next(cancel)))
}

/// 将异步闭包擦除为 [`EndNotifier`]。
pub fn end_notifier<F, Fut>(on_end: F) -> EndNotifier
where
    F: FnOnce(Cancellation) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |cancel| Box::pin(on_end(cancel)))
}

/// 将异步闭包擦除为 [`InitialMoveNext`]。
pub fn initial_move_next<T, F, Fut>(initial: F) -> InitialMoveNext<T>
where
    F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FirstStep<T>>> + Send + 'static,
{
    Arc::new(move |cancel| Box::pin(initial(cancel)))
}

/// 当前信息槽位：最近产出且尚未消费的元素、下一步续延、本轮结束通知。
///
/// 对任何 `T` 都按值内联存放，不存在装箱开销，因此无需为原始数值类型提供特化版本。
pub(crate) struct CurrentInfo<T> {
    pub(crate) item: Option<T>,
    pub(crate) next: Option<Continuation<T>>,
    pub(crate) on_end: Option<EndNotifier>,
}

impl<T> CurrentInfo<T> {
    pub(crate) const fn empty() -> Self {
        Self {
            item: None,
            next: None,
            on_end: None,
        }
    }

    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::empty())
    }
}
