use async_trait::async_trait;

use crate::{contract::Cancellation, error::Result};

/// 顺序枚举的对象安全契约。
///
/// # 教案式说明
/// - **意图 (Why)**：让驱动辅助函数与宿主代码同时接受核心枚举器与其可观测装饰器，
///   也允许以 `Box<dyn SequentialEnumeration<T>>` 形式跨组件传递；
/// - **契约 (What)**：语义与 [`AsyncEnumerator`](crate::AsyncEnumerator) 的同名方法完全一致；
///   `is_parallel_enumeration_supported` 对实现者恒为 `false`；
/// - **设计权衡 (Trade-offs)**：`async_trait` 每次调用产生一次 Future 装箱，热路径上可直接调用固有方法规避。
#[async_trait]
pub trait SequentialEnumeration<T: Send>: Send + Sync {
    /// 请求下一个元素。
    async fn advance(&self, cancel: &Cancellation) -> Result<bool>;

    /// 取走当前元素，每步至多一次。
    fn take_current(&self) -> Option<T>;

    /// 结束本轮并复位。
    async fn end(&self, cancel: &Cancellation) -> Result<bool>;

    /// 是否允许多个步进同时在途。
    fn is_parallel_enumeration_supported(&self) -> bool {
        false
    }
}
