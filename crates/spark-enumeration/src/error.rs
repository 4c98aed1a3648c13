//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为枚举引擎对外暴露的失败语义提供集中定义：并发误用、生产者失败、取消、内部不变量破坏；
//! - 观察者（事件订阅者）的失败不在此列，它们在分发点被隔离，不会进入枚举调用链。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接 `?` 传播；
//! - 枚举内部没有任何重试逻辑，是否重试由生产者或宿主决定。

use std::error::Error as StdError;

use thiserror::Error;

use crate::state::EnumerationState;

/// 生产者失败的擦除形态。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 本 crate 统一使用的 `Result` 别名。
pub type Result<T, E = EnumerationError> = std::result::Result<T, E>;

/// 异步枚举引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“调用方用错了”（`ConcurrentUse`）与“生产者失败了”（`Producer`），
///   前者是编程缺陷，后者是运行期故障，运维处置方式完全不同；
/// - **契约 (What)**：所有变体 `Send + Sync + 'static`，可跨任务传播；
/// - **设计权衡 (Trade-offs)**：`Producer` 以 `BoxError` 承载任意来源的错误，牺牲一次堆分配换取
///   生产者实现的自由度。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnumerationError {
    /// 同一顺序枚举器上已有另一个步进 / 读取 / 结束操作在进行中。
    ///
    /// - **契约 (What)**：`operation` 为被拒绝的操作名，`state` 为拒绝时观察到的状态；
    /// - **风险 (Trade-offs)**：该错误从不排队或重试，出现即意味着调用方违反单消费者约定。
    #[error("enumerator is busy: `{operation}` rejected while in state {state:?}")]
    ConcurrentUse {
        operation: &'static str,
        state: EnumerationState,
    },

    /// 生产者回调（步进续延或结束通知）返回的失败，原样透传给调用方。
    #[error("producer failed: {0}")]
    Producer(#[source] BoxError),

    /// 操作开始前观测到取消信号。
    #[error("enumeration cancelled")]
    Cancelled,

    /// 并行枚举器的令牌映射中已存在同一令牌，属于内部不变量破坏。
    #[error("internal invariant violated: token {token} already present in the item map")]
    DuplicateToken { token: u64 },

    /// 并行枚举器本轮的令牌序号已用尽，需要 `reset` 开启新一轮。
    #[error("parallel enumeration pass {pass} has no token sequence numbers left")]
    TokensExhausted { pass: u64 },
}

impl EnumerationError {
    /// 将任意错误包装为生产者失败。
    pub fn producer<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Producer(error.into())
    }

    /// 是否为并发误用。
    pub fn is_concurrent_use(&self) -> bool {
        matches!(self, Self::ConcurrentUse { .. })
    }
}
