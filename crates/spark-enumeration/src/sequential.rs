//! # AsyncEnumerator：顺序异步枚举状态机
//!
//! ## 核心意图（Why）
//! - 让生产者在异步挂起下逐个产出元素，而消费者以“步进 / 取当前 / 结束”三个操作驱动；
//! - 单消费者、不可重入：并发误用在状态字上即可被检测，以错误返回，绝不阻塞也绝不破坏状态。
//!
//! ## 行为契约（What）
//! - `advance`：返回是否有新的当前元素；首次调用生产者入口，其后调用上一步返回的续延；
//! - `take_current`：每次成功步进后恰好交付一次元素，第二次返回 `None`；
//! - `end`：可在自然耗尽后或步进中途调用；中途结束会先把生产者续延链排空，再调用结束通知，
//!   随后复位到 `Initial`，实例可开始新一轮。
//!
//! ## 并发模型（How）
//! - 所有转移都是单字 CAS（见 [`crate::state`]）；
//! - 当前信息槽位由 `spin::Mutex` 保护，只在 CAS 已授予独占权后做极短的取放，从不跨越 `.await`；
//! - 生产者结束通知在每一轮中恰好被调用一次，且总由 `end` 在排空之后调用：步进途中到来的 `end`
//!   先把状态置为 `Resetting`，等待在途步进把续延交还槽位，再排空并通知，最后才复位到 `Initial`。
//!
//! ## 风险提示（Trade-offs）
//! - 中途结束的排空假定生产者续延链必然终止；永不报告耗尽的生产者会让 `end` 无限循环，
//!   这是生产者契约的一部分，本实现不设人为的迭代上限。

use std::{
    fmt,
    future::{Future, poll_fn},
    sync::Arc,
    task::Poll,
};

use async_trait::async_trait;
use futures_util::task::AtomicWaker;
use spin::Mutex;
use tracing::{debug, warn};

use crate::{
    contract::Cancellation,
    error::{EnumerationError, Result},
    events::invoke_isolated,
    producer::{
        Continuation, CurrentInfo, EndNotifier, FirstStep, InitialMoveNext, Step,
        initial_move_next,
    },
    state::{AtomicState, EnumerationState},
    traits::SequentialEnumeration,
};

/// 成功步进后、元素对外可见前执行的钩子；其 panic 会被吞掉。
pub type AdvanceHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// 顺序异步枚举器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“生产者回调链”封装为可复用、可检测误用的状态机；
/// - **契约 (What)**：`T: Send + 'static` 即可在任务间移动；方法均取 `&self`，
///   以便并发误用能在运行期被观测并报告；
/// - **设计权衡 (Trade-offs)**：槽位按值持有 `T`，没有装箱；代价是 `take_current` 只能交付一次。
pub struct AsyncEnumerator<T> {
    state: AtomicState,
    current: Mutex<Slot<T>>,
    /// 等待在途步进交还续延的 `end`。
    handoff: AtomicWaker,
    initial: InitialMoveNext<T>,
    on_advance: Option<AdvanceHook<T>>,
}

impl<T> AsyncEnumerator<T>
where
    T: Send + 'static,
{
    /// 以生产者入口构造枚举器。
    pub fn new<F, Fut>(initial: F) -> Self
    where
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FirstStep<T>>> + Send + 'static,
    {
        Self::from_initial(initial_move_next(initial))
    }

    /// 以已擦除的生产者入口构造枚举器。
    pub fn from_initial(initial: InitialMoveNext<T>) -> Self {
        Self {
            state: AtomicState::new(EnumerationState::Initial),
            current: Mutex::new(Slot {
                info: CurrentInfo::empty(),
                in_flight: false,
            }),
            handoff: AtomicWaker::new(),
            initial,
            on_advance: None,
        }
    }

    /// 附加“成功步进后”钩子。
    pub fn with_advance_hook(mut self, hook: AdvanceHook<T>) -> Self {
        self.on_advance = Some(hook);
        self
    }

    /// 立即耗尽的枚举器。
    pub fn empty() -> Self {
        Self::new(|_cancel| async { Ok(FirstStep::new(Step::Exhausted)) })
    }

    /// 基于内存序列的枚举器，每一轮都从头产出全部元素的克隆。
    pub fn from_vec(items: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        let items: Arc<[T]> = items.into();
        Self::new(move |_cancel| {
            let items = Arc::clone(&items);
            async move { Ok(FirstStep::new(step_at(items, 0))) }
        })
    }

    /// 当前状态快照，仅用于诊断。
    pub fn state(&self) -> EnumerationState {
        self.state.load()
    }

    /// 顺序枚举器不支持并发步进。
    pub fn is_parallel_enumeration_supported(&self) -> bool {
        false
    }

    /// 请求下一个元素。
    ///
    /// # 契约说明（What）
    /// - 返回 `Ok(true)`：新元素已就绪，可通过 [`take_current`](Self::take_current) 取走；
    /// - 返回 `Ok(false)`：序列已耗尽（此后重复调用仍返回 `false`，直到 `end` 复位）；
    /// - 返回 `Err(ConcurrentUse)`：另一个步进 / 读取 / 结束正在进行；
    /// - 若上一步的元素尚未被读取，本次步进合法，未读元素被丢弃。
    pub async fn advance(&self, cancel: &Cancellation) -> Result<bool> {
        cancel.check()?;
        let (from, next) = {
            let mut slot = self.current.lock();
            if slot.in_flight {
                return Err(EnumerationError::ConcurrentUse {
                    operation: "advance",
                    state: self.state.load(),
                });
            }
            let from = match self.state.transition_from_any(
                &[EnumerationState::Initial, EnumerationState::MoveNextEnded],
                EnumerationState::MoveNextStarted,
            ) {
                Ok(from) => from,
                Err(EnumerationState::Ended) => return Ok(false),
                Err(state) => {
                    return Err(EnumerationError::ConcurrentUse {
                        operation: "advance",
                        state,
                    });
                }
            };
            slot.in_flight = true;
            // 未读的上一元素在此被丢弃。
            slot.info.item = None;
            (from, slot.info.next.take())
        };
        let mut in_flight = InFlight {
            enumerator: self,
            armed: true,
        };

        let (step, on_end) = if from == EnumerationState::Initial {
            let FirstStep { step, on_end } = (self.initial)(cancel.child()).await?;
            (step, on_end)
        } else {
            let step = match next {
                Some(next) => next(cancel.child()).await?,
                None => Step::Exhausted,
            };
            (step, None)
        };
        in_flight.armed = false;
        self.complete(step, on_end)
    }

    /// 发布一次步进的结果。
    ///
    /// - 状态仍为 `MoveNextStarted`：转入 `MoveNextEnded` / `Ended`，钩子在转移成功后、
    ///   元素放入槽位前执行，此间 `in_flight` 保持为真，并发 `end` 会等待元素就位；
    /// - 状态已被并发 `end` 改为 `Resetting`：元素不对外暴露，续延与结束通知交还槽位，
    ///   由 `end` 负责排空与通知。
    fn complete(&self, step: Step<T>, on_end: Option<EndNotifier>) -> Result<bool> {
        let (item, next) = match step {
            Step::Item { item, next } => (Some(item), Some(next)),
            Step::Exhausted => (None, None),
        };
        let produced = item.is_some();
        let target = if produced {
            EnumerationState::MoveNextEnded
        } else {
            EnumerationState::Ended
        };

        let pending_item = {
            let mut slot = self.current.lock();
            slot.info.next = next;
            if on_end.is_some() {
                slot.info.on_end = on_end;
            }
            if let Err(state) = self.state.transition(EnumerationState::MoveNextStarted, target) {
                drop(item);
                slot.in_flight = false;
                drop(slot);
                self.handoff.wake();
                return Err(EnumerationError::ConcurrentUse {
                    operation: "advance",
                    state,
                });
            }
            match (item, self.on_advance.is_some()) {
                (Some(item), true) => Some(item),
                (item, _) => {
                    slot.info.item = item;
                    slot.in_flight = false;
                    None
                }
            }
        };

        if let Some(item) = pending_item {
            if let Some(message) = self
                .on_advance
                .as_ref()
                .and_then(|hook| invoke_isolated(|| hook(&item)))
            {
                warn!(%message, "advance hook panicked; failure swallowed");
            }
            let mut slot = self.current.lock();
            slot.info.item = Some(item);
            slot.in_flight = false;
            drop(slot);
            self.handoff.wake();
        }
        Ok(produced)
    }

    /// 取走当前元素；同一步只交付一次，其余情况返回 `None`。
    pub fn take_current(&self) -> Option<T> {
        self.state
            .transition(
                EnumerationState::MoveNextEnded,
                EnumerationState::CurrentReading,
            )
            .ok()?;
        let item = self.current.lock().info.item.take();
        self.state.store(EnumerationState::MoveNextEnded);
        item
    }

    /// 结束本轮枚举并复位。
    ///
    /// # 契约说明（What）
    /// - 从 `Initial` 调用：没有可结束的一轮，返回 `Ok(false)`；
    /// - 从 `MoveNextStarted` / `MoveNextEnded`（提前终止）调用：先排空续延链，再调用结束通知；
    ///   若仍有步进在途，先等待它把续延交还槽位，期间状态保持 `Resetting`，新一轮的步进会被拒绝；
    /// - 从 `Ended` 调用：直接调用结束通知；
    /// - 无论排空或通知是否失败，状态都会复位到 `Initial`；失败随后返回，排空失败优先。
    ///
    /// # 前置条件（Contract）
    /// - 排空没有次数上限：生产者的续延链必须在有限步内报告 [`Step::Exhausted`]，否则提前终止不会返回。
    pub async fn end(&self, cancel: &Cancellation) -> Result<bool> {
        const ENDABLE: [EnumerationState; 3] = [
            EnumerationState::Ended,
            EnumerationState::MoveNextEnded,
            EnumerationState::MoveNextStarted,
        ];
        let from = loop {
            match self
                .state
                .transition_from_any(&ENDABLE, EnumerationState::Resetting)
            {
                Ok(from) => break from,
                // 三次 CAS 之间状态被在途步进推进，重试即可。
                Err(state) if ENDABLE.contains(&state) => continue,
                Err(EnumerationState::Initial) => return Ok(false),
                Err(state) => {
                    return Err(EnumerationError::ConcurrentUse {
                        operation: "end",
                        state,
                    });
                }
            }
        };

        let CurrentInfo { item, next, on_end } = poll_fn(|cx| {
            let mut slot = self.current.lock();
            if slot.in_flight {
                self.handoff.register(cx.waker());
                return Poll::Pending;
            }
            Poll::Ready(slot.info.take())
        })
        .await;
        drop(item);

        let drained = if from == EnumerationState::Ended {
            Ok(0)
        } else {
            drain(next, cancel).await
        };
        if let (Ok(count), true) = (&drained, from != EnumerationState::Ended) {
            debug!(
                abandoned_from = ?from,
                drained = *count,
                "enumeration ended before exhaustion; continuation chain drained"
            );
        }

        let notified = match on_end {
            Some(on_end) => on_end(cancel.child()).await,
            None => Ok(()),
        };
        self.state.store(EnumerationState::Initial);

        drained?;
        notified?;
        Ok(true)
    }
}

/// 当前信息槽位与“步进在途”标记。
///
/// `in_flight` 只在持有槽位锁时读写：步进在转移到 `MoveNextStarted` 的同一临界区内置位，
/// 在交还续延（或放入元素）的同一临界区内清除，`end` 据此判断是否需要等待交接。
struct Slot<T> {
    info: CurrentInfo<T>,
    in_flight: bool,
}

/// 步进在途凭证：步进失败或其 future 被丢弃时清除在途标记并唤醒等待中的 `end`。
struct InFlight<'a, T> {
    enumerator: &'a AsyncEnumerator<T>,
    armed: bool,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.enumerator.current.lock().in_flight = false;
            self.enumerator.handoff.wake();
        }
    }
}

/// 逐个调用剩余续延直到生产者报告耗尽，返回被丢弃的元素数。
async fn drain<T>(mut next: Option<Continuation<T>>, cancel: &Cancellation) -> Result<u64> {
    let mut drained = 0_u64;
    while let Some(continuation) = next.take() {
        match continuation(cancel.child()).await? {
            Step::Item { item, next: following } => {
                drop(item);
                drained += 1;
                next = Some(following);
            }
            Step::Exhausted => break,
        }
    }
    Ok(drained)
}

fn step_at<T>(items: Arc<[T]>, index: usize) -> Step<T>
where
    T: Clone + Send + Sync + 'static,
{
    match items.get(index).cloned() {
        Some(item) => Step::item(item, move |_cancel| async move {
            Ok(step_at(items, index + 1))
        }),
        None => Step::Exhausted,
    }
}

#[async_trait]
impl<T> SequentialEnumeration<T> for AsyncEnumerator<T>
where
    T: Send + 'static,
{
    async fn advance(&self, cancel: &Cancellation) -> Result<bool> {
        AsyncEnumerator::advance(self, cancel).await
    }

    fn take_current(&self) -> Option<T> {
        AsyncEnumerator::take_current(self)
    }

    async fn end(&self, cancel: &Cancellation) -> Result<bool> {
        AsyncEnumerator::end(self, cancel).await
    }
}

impl<T> fmt::Debug for AsyncEnumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEnumerator")
            .field("state", &self.state.load())
            .field("has_advance_hook", &self.on_advance.is_some())
            .finish()
    }
}
