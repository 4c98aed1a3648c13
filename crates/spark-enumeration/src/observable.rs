//! # ObservableEnumerator：生命周期事件装饰器
//!
//! ## 核心意图（Why）
//! - 在不改变顺序状态机任何保证的前提下，把“开始 / 每元素 / 结束”转换为事件分发；
//! - 核心枚举器对事件一无所知：装饰器只拦截生产者入口调用、成功步进钩子与结束通知。
//!
//! ## 行为契约（What）
//! - 每个生命周期点最多物化一次事件参数，并在实例级与全局级订阅者之间复用；
//! - 两级都没有订阅者时完全不构造事件参数；
//! - 全局订阅者集合通过宿主提供的解析器按需获取，解析器返回 `None` 表示没有全局订阅；
//! - 订阅者 panic 被隔离并以 `warn` 级别记录，绝不传播到枚举调用方。
//!
//! ## 事件顺序（How）
//! `before_start → (生产者入口) → after_start → item* → before_end → (生产者结束通知) → after_end`；
//! 若生产者入口失败，本轮不会再有 `after_start` 与结束类事件。

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    contract::Cancellation,
    error::Result,
    events::{
        EnumerationEvents, EnumerationMeta, GlobalEventsAccessor, HandlerList, ItemEventArgs,
        LifecycleEventArgs, LifecycleHandler, dispatch_isolated,
    },
    producer::{EndNotifier, FirstStep, InitialMoveNext, end_notifier, initial_move_next},
    sequential::AsyncEnumerator,
    state::EnumerationState,
    traits::SequentialEnumeration,
};

static NEXT_ENUMERATOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug)]
enum Stage {
    BeforeStart,
    AfterStart,
    BeforeEnd,
    AfterEnd,
}

impl Stage {
    fn select<T>(self, events: &EnumerationEvents<T>) -> &HandlerList<LifecycleHandler> {
        match self {
            Stage::BeforeStart => events.before_start(),
            Stage::AfterStart => events.after_start(),
            Stage::BeforeEnd => events.before_end(),
            Stage::AfterEnd => events.after_end(),
        }
    }
}

/// 装饰器与被包装回调共享的观测状态。
struct ObserverShared<T> {
    enumerator_id: u64,
    pass: AtomicU64,
    items_produced: AtomicU64,
    materialized: AtomicU64,
    events: EnumerationEvents<T>,
    global: Option<GlobalEventsAccessor<T>>,
}

impl<T> ObserverShared<T> {
    fn meta(&self) -> EnumerationMeta {
        EnumerationMeta {
            enumerator_id: self.enumerator_id,
            pass: self.pass.load(Ordering::Acquire),
            items_produced: self.items_produced.load(Ordering::Acquire),
        }
    }

    fn global_events(&self) -> Option<Arc<EnumerationEvents<T>>> {
        self.global.as_ref().and_then(|resolve| resolve())
    }

    fn begin_pass(&self) {
        self.pass.fetch_add(1, Ordering::AcqRel);
        self.items_produced.store(0, Ordering::Release);
    }

    fn fire(&self, stage: Stage) {
        let local = stage.select(&self.events).snapshot();
        let global = self
            .global_events()
            .map(|events| stage.select(&events).snapshot())
            .unwrap_or_default();
        if local.is_empty() && global.is_empty() {
            return;
        }

        self.materialized.fetch_add(1, Ordering::Relaxed);
        let args = LifecycleEventArgs { meta: self.meta() };
        for (scope, handlers) in [("instance", &local), ("global", &global)] {
            for failure in dispatch_isolated(handlers, |handler| handler(&args)) {
                warn!(
                    enumerator_id = self.enumerator_id,
                    ?stage,
                    scope,
                    %failure,
                    "enumeration observer failed; failure swallowed"
                );
            }
        }
    }

    fn fire_item(&self, item: &T) {
        self.items_produced.fetch_add(1, Ordering::AcqRel);
        let local = self.events.item().snapshot();
        let global = self
            .global_events()
            .map(|events| events.item().snapshot())
            .unwrap_or_default();
        if local.is_empty() && global.is_empty() {
            return;
        }

        self.materialized.fetch_add(1, Ordering::Relaxed);
        let args = ItemEventArgs {
            meta: self.meta(),
            item,
        };
        for (scope, handlers) in [("instance", &local), ("global", &global)] {
            for failure in dispatch_isolated(handlers, |handler| handler(&args)) {
                warn!(
                    enumerator_id = self.enumerator_id,
                    scope,
                    %failure,
                    "enumeration item observer failed; failure swallowed"
                );
            }
        }
    }
}

/// 带生命周期事件的顺序枚举器。
///
/// # 教案式说明
/// - **意图 (Why)**：为枚举提供可插拔的观测点，同时保证观察者永远无法破坏枚举；
/// - **契约 (What)**：`advance` / `take_current` / `end` 的语义与 [`AsyncEnumerator`] 完全一致，
///   状态机逻辑全部委托给内部实例；
/// - **设计权衡 (Trade-offs)**：每个生命周期点都要检查两级订阅列表（各一次读锁），
///   换来零订阅时零事件参数构造。
pub struct ObservableEnumerator<T> {
    inner: AsyncEnumerator<T>,
    shared: Arc<ObserverShared<T>>,
}

impl<T> ObservableEnumerator<T>
where
    T: Send + 'static,
{
    /// 仅带实例级事件的装饰器。
    pub fn new<F, Fut>(initial: F) -> Self
    where
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FirstStep<T>>> + Send + 'static,
    {
        Self::from_initial(initial_move_next(initial), None)
    }

    /// 同时接入宿主全局事件集合的装饰器。
    pub fn with_global_events<F, Fut>(initial: F, global: GlobalEventsAccessor<T>) -> Self
    where
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FirstStep<T>>> + Send + 'static,
    {
        Self::from_initial(initial_move_next(initial), Some(global))
    }

    /// 以已擦除的生产者入口构造。
    pub fn from_initial(
        initial: InitialMoveNext<T>,
        global: Option<GlobalEventsAccessor<T>>,
    ) -> Self {
        let shared = Arc::new(ObserverShared {
            enumerator_id: NEXT_ENUMERATOR_ID.fetch_add(1, Ordering::Relaxed),
            pass: AtomicU64::new(0),
            items_produced: AtomicU64::new(0),
            materialized: AtomicU64::new(0),
            events: EnumerationEvents::new(),
            global,
        });

        let observed_initial = {
            let shared = Arc::clone(&shared);
            initial_move_next(move |cancel: Cancellation| {
                let shared = Arc::clone(&shared);
                let initial = Arc::clone(&initial);
                async move {
                    shared.begin_pass();
                    shared.fire(Stage::BeforeStart);
                    let FirstStep { step, on_end } = initial(cancel).await?;
                    shared.fire(Stage::AfterStart);
                    Ok(FirstStep {
                        step,
                        on_end: Some(observed_end(shared, on_end)),
                    })
                }
            })
        };

        let item_hook = {
            let shared = Arc::clone(&shared);
            Arc::new(move |item: &T| shared.fire_item(item))
        };

        Self {
            inner: AsyncEnumerator::from_initial(observed_initial).with_advance_hook(item_hook),
            shared,
        }
    }

    /// 实例级订阅入口。
    pub fn events(&self) -> &EnumerationEvents<T> {
        &self.shared.events
    }

    /// 进程内唯一的枚举器编号。
    pub fn enumerator_id(&self) -> u64 {
        self.shared.enumerator_id
    }

    /// 迄今为止实际构造过的事件参数个数（诊断用）。
    pub fn materialized_event_args(&self) -> u64 {
        self.shared.materialized.load(Ordering::Relaxed)
    }

    /// 内部状态快照。
    pub fn state(&self) -> EnumerationState {
        self.inner.state()
    }

    pub fn is_parallel_enumeration_supported(&self) -> bool {
        false
    }

    pub async fn advance(&self, cancel: &Cancellation) -> Result<bool> {
        self.inner.advance(cancel).await
    }

    pub fn take_current(&self) -> Option<T> {
        self.inner.take_current()
    }

    pub async fn end(&self, cancel: &Cancellation) -> Result<bool> {
        self.inner.end(cancel).await
    }
}

/// 用结束前 / 结束后事件包裹生产者的结束通知（生产者未提供时也照常发出事件）。
fn observed_end<T>(shared: Arc<ObserverShared<T>>, on_end: Option<EndNotifier>) -> EndNotifier
where
    T: Send + 'static,
{
    end_notifier(move |cancel: Cancellation| async move {
        shared.fire(Stage::BeforeEnd);
        let outcome = match on_end {
            Some(on_end) => on_end(cancel).await,
            None => Ok(()),
        };
        shared.fire(Stage::AfterEnd);
        outcome
    })
}

#[async_trait]
impl<T> SequentialEnumeration<T> for ObservableEnumerator<T>
where
    T: Send + 'static,
{
    async fn advance(&self, cancel: &Cancellation) -> Result<bool> {
        ObservableEnumerator::advance(self, cancel).await
    }

    fn take_current(&self) -> Option<T> {
        ObservableEnumerator::take_current(self)
    }

    async fn end(&self, cancel: &Cancellation) -> Result<bool> {
        ObservableEnumerator::end(self, cancel).await
    }
}

impl<T> fmt::Debug for ObservableEnumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableEnumerator")
            .field("enumerator_id", &self.shared.enumerator_id)
            .field("inner", &self.inner)
            .field("events", &self.shared.events)
            .finish()
    }
}
