//! # spark-enumeration
//!
//! ## 定位与职责（Why）
//! - 让生产者在异步挂起下逐个产出元素，同时为消费者提供两种截然不同的并发纪律：
//!   严格顺序（单消费者、可检测误用）与基于令牌的并行（多步进同时在途）；
//! - 在顺序枚举之上透明叠加生命周期事件，观察者永远无法破坏枚举本身。
//!
//! ## 架构嵌入（Where）
//! - `sequential` 模块是核心：单字原子状态机 + 短临界区当前信息槽位；
//! - `observable` 模块以装饰器形式拦截生产者入口、成功步进与结束通知三个点；
//! - `parallel` 模块以单调令牌 + 并发映射实现并行枚举；
//! - `drive` 模块把协议折叠为 `for_each` / `collect` 等常见消费循环；
//! - `spark-bufstream` 在本 crate 之上提供以字节流为后端的枚举。
//!
//! ## Feature 策略（Trade-offs）
//! - `concurrent-map`（默认开启）：令牌映射使用 `dashmap`；关闭后以 `parking_lot` 互斥锁包住
//!   单次映射操作，适用于不希望引入分片表的宿主。

/// 取消契约。
pub mod contract;

/// 通用消费循环。
pub mod drive;

/// 错误类型与结果别名。
pub mod error;

/// 订阅列表、事件参数与分发模式。
pub mod events;

/// 对象安全的 Future 别名。
pub mod future;

/// 可观测装饰器。
pub mod observable;

/// 基于令牌的并行枚举。
pub mod parallel;

/// 生产者契约：入口、续延与结束通知。
pub mod producer;

/// 顺序枚举状态机。
pub mod sequential;

/// 枚举状态与原子状态字。
pub mod state;

mod token_map;

/// 顺序枚举的对象安全契约。
pub mod traits;

pub use contract::Cancellation;
pub use drive::{collect, for_each, for_each_concurrent};
pub use error::{BoxError, EnumerationError, Result};
pub use events::{
    EnumerationEvents, EnumerationMeta, GlobalEventsAccessor, HandlerFailure, HandlerList,
    ItemEventArgs, ItemHandler, LifecycleEventArgs, LifecycleHandler, SubscriptionId,
    dispatch_fail_fast, dispatch_isolated,
};
pub use future::BoxFuture;
pub use observable::ObservableEnumerator;
pub use parallel::{EnumerationToken, ParallelEnumerator};
pub use producer::{Continuation, EndNotifier, FirstStep, InitialMoveNext, Step};
pub use sequential::{AdvanceHook, AsyncEnumerator};
pub use state::EnumerationState;
pub use traits::SequentialEnumeration;
