use std::{future::Future, pin::Pin};

/// `BoxFuture` 是生产者回调统一返回的对象安全 Future 包装。
///
/// # 设计背景（Why）
/// - 续延（continuation）在每一步由生产者动态给出，类型各不相同，必须擦除为同一形态才能存入
///   当前信息槽位。
///
/// # 契约说明（What）
/// - 约束 Future 为 `Send + 'a`，可安全跨线程挂起与恢复。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
