//! # events：枚举生命周期事件通道
//!
//! ## 核心意图（Why）
//! - 为可观测装饰器提供“有序回调列表 + 失败隔离”的最小设施，核心状态机对此一无所知；
//! - 订阅者的失败（panic）必须在分发点被捕获，绝不能影响枚举的正确性。
//!
//! ## 行为契约（What）
//! - [`HandlerList`]：按订阅顺序保存回调，分发前在读锁内做快照，回调本身永远在锁外执行；
//! - [`dispatch_isolated`]：执行全部回调并收集失败；
//! - [`dispatch_fail_fast`]：遇到首个失败即停止并返回该失败；
//! - [`EnumerationEvents`]：五个生命周期通道（开始前 / 开始后 / 每元素 / 结束前 / 结束后）。
//!
//! ## 风险提示（Trade-offs）
//! - 失败隔离依赖 `catch_unwind`；若宿主以 `panic = "abort"` 构建，订阅者 panic 会直接终止进程。

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

/// 订阅句柄，用于退订。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 单个回调失败的诊断信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    /// 回调在快照中的位置。
    pub index: usize,
    /// panic 负载的可读文本。
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler #{} panicked: {}", self.index, self.message)
    }
}

/// 有序回调列表。
///
/// `H` 通常是 `dyn Fn(&Args) + Send + Sync`，以 `Arc<H>` 形式存放，快照只复制指针。
pub struct HandlerList<H: ?Sized> {
    handlers: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
    next_id: AtomicU64,
}

impl<H: ?Sized> HandlerList<H> {
    /// 创建空列表。
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// 追加订阅者，返回退订句柄。
    pub fn subscribe(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// 按句柄退订；返回是否确实移除了订阅者。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// 当前订阅者数量。
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// 是否没有订阅者。
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// 复制当前订阅者列表；列表为空时不分配。
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        let handlers = self.handlers.read();
        if handlers.is_empty() {
            return Vec::new();
        }
        handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect()
    }
}

impl<H: ?Sized> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> fmt::Debug for HandlerList<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerList")
            .field("len", &self.len())
            .finish()
    }
}

/// 依次执行全部回调，隔离并收集每个失败。
pub fn dispatch_isolated<H, F>(handlers: &[Arc<H>], invoke: F) -> Vec<HandlerFailure>
where
    H: ?Sized,
    F: Fn(&H),
{
    let mut failures = Vec::new();
    for (index, handler) in handlers.iter().enumerate() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| invoke(handler))) {
            failures.push(HandlerFailure {
                index,
                message: panic_message(payload.as_ref()),
            });
        }
    }
    failures
}

/// 依次执行回调，遇到首个失败立即停止并返回。
pub fn dispatch_fail_fast<H, F>(handlers: &[Arc<H>], invoke: F) -> Result<(), HandlerFailure>
where
    H: ?Sized,
    F: Fn(&H),
{
    for (index, handler) in handlers.iter().enumerate() {
        catch_unwind(AssertUnwindSafe(|| invoke(handler))).map_err(|payload| HandlerFailure {
            index,
            message: panic_message(payload.as_ref()),
        })?;
    }
    Ok(())
}

/// 执行单个回调并吞掉其失败，返回失败信息供调用方记录。
pub(crate) fn invoke_isolated<F: FnOnce()>(f: F) -> Option<String> {
    catch_unwind(AssertUnwindSafe(f))
        .err()
        .map(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// 生命周期事件携带的元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnumerationMeta {
    /// 进程内唯一的枚举器编号。
    pub enumerator_id: u64,
    /// 当前是第几轮枚举，从 1 开始。
    pub pass: u64,
    /// 本轮已产出的元素数（含当前元素）。
    pub items_produced: u64,
}

/// 开始 / 结束类事件参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEventArgs {
    pub meta: EnumerationMeta,
}

/// 每元素事件参数，借用刚产出的元素。
#[derive(Debug)]
pub struct ItemEventArgs<'a, T> {
    pub meta: EnumerationMeta,
    pub item: &'a T,
}

/// 开始 / 结束类回调。
pub type LifecycleHandler = dyn Fn(&LifecycleEventArgs) + Send + Sync;

/// 每元素回调。
pub type ItemHandler<T> = dyn for<'a> Fn(&ItemEventArgs<'a, T>) + Send + Sync;

/// 宿主提供的全局事件解析器：按需返回（或不返回）共享的订阅者集合。
pub type GlobalEventsAccessor<T> =
    Arc<dyn Fn() -> Option<Arc<EnumerationEvents<T>>> + Send + Sync>;

/// 五个生命周期通道的集合。
///
/// - **意图 (Why)**：实例级与全局级订阅共用同一形态，装饰器对二者一视同仁地分发；
/// - **契约 (What)**：全局集合由宿主持有并通过 [`GlobalEventsAccessor`] 暴露，本 crate 不保存任何静态可变状态。
pub struct EnumerationEvents<T> {
    before_start: HandlerList<LifecycleHandler>,
    after_start: HandlerList<LifecycleHandler>,
    item: HandlerList<ItemHandler<T>>,
    before_end: HandlerList<LifecycleHandler>,
    after_end: HandlerList<LifecycleHandler>,
}

impl<T> EnumerationEvents<T> {
    pub fn new() -> Self {
        Self {
            before_start: HandlerList::new(),
            after_start: HandlerList::new(),
            item: HandlerList::new(),
            before_end: HandlerList::new(),
            after_end: HandlerList::new(),
        }
    }

    /// 首次步进调用生产者之前。
    pub fn before_start(&self) -> &HandlerList<LifecycleHandler> {
        &self.before_start
    }

    /// 首次步进调用生产者之后。
    pub fn after_start(&self) -> &HandlerList<LifecycleHandler> {
        &self.after_start
    }

    /// 每次成功步进、元素对消费者可见之前。
    pub fn item(&self) -> &HandlerList<ItemHandler<T>> {
        &self.item
    }

    /// 调用生产者结束通知之前。
    pub fn before_end(&self) -> &HandlerList<LifecycleHandler> {
        &self.before_end
    }

    /// 调用生产者结束通知之后（无论其成功与否）。
    pub fn after_end(&self) -> &HandlerList<LifecycleHandler> {
        &self.after_end
    }
}

impl<T> Default for EnumerationEvents<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EnumerationEvents<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumerationEvents")
            .field("before_start", &self.before_start.len())
            .field("after_start", &self.after_start.len())
            .field("item", &self.item.len())
            .field("before_end", &self.before_end.len())
            .field("after_end", &self.after_end.len())
            .finish()
    }
}
