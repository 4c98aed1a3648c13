//! # ParallelEnumerator：基于令牌的并行异步枚举
//!
//! ## 核心意图（Why）
//! - 允许多个步进同时在途：每次步进铸造一个单调递增的令牌，元素按令牌存入并发映射，
//!   调用方凭令牌取回恰好属于自己的元素；
//! - 正确性只依赖令牌唯一性与映射操作的原子性，不需要全局锁。
//!
//! ## 行为契约（What）
//! - `advance`：无状态谓词判定还有元素时铸造令牌、异步获取元素并入表，返回 `Some(token)`；
//!   谓词为假时返回 `None`；
//! - `retrieve`：原子移除并返回令牌对应元素；未知或已取回的令牌返回 `None`；
//! - `reset`：开启新一轮（轮次号加一、序号归零）、清空映射并调用生产者释放钩子。
//!
//! ## 令牌布局（How）
//! - 计数字的高 24 位是轮次号，低 40 位是本轮序号；步进以一次 CAS 同时领取两者；
//! - 映射键就是完整计数字，因此跨轮的令牌永不相撞；在 `reset` 之后才完成获取的旧轮步进，
//!   入表后发现轮次已变会撤回自己的元素，并返回 `None`。
//!
//! ## 风险提示（Trade-offs）
//! - 轮次号按 24 位回绕；一个步进需要在连续约一千六百万次 `reset` 期间始终在途才可能误判轮次。

use std::{
    fmt,
    future::Future,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    contract::Cancellation,
    error::{EnumerationError, Result},
    future::BoxFuture,
    token_map::TokenMap,
};

const SEQUENCE_BITS: u32 = 40;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const PASS_MASK: u64 = (1 << (u64::BITS - SEQUENCE_BITS)) - 1;

fn pass_of(word: u64) -> u64 {
    word >> SEQUENCE_BITS
}

/// 关联一次并行步进与其产出元素的不透明令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumerationToken(NonZeroU64);

impl EnumerationToken {
    /// 本轮内的序号（从 1 开始）。
    pub fn get(self) -> u64 {
        self.0.get() & SEQUENCE_MASK
    }

    /// 铸造该令牌的轮次（首轮为 0，每次 `reset` 加一）。
    pub fn pass(self) -> u64 {
        pass_of(self.0.get())
    }

    fn key(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for EnumerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.pass(), self.get())
    }
}

/// “是否还有元素”的无状态谓词。
pub type HasNext = Arc<dyn Fn() -> bool + Send + Sync>;

/// 按令牌获取元素。
pub type FetchItem<T> =
    Arc<dyn Fn(EnumerationToken, Cancellation) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// 生产者释放钩子，每次 `reset` 调用一次。
pub type DisposeHook = Arc<dyn Fn(Cancellation) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// 并行异步枚举器。
pub struct ParallelEnumerator<T> {
    /// 轮次号与本轮序号的打包计数字。
    counter: AtomicU64,
    items: TokenMap<T>,
    has_next: HasNext,
    fetch: FetchItem<T>,
    dispose: Option<DisposeHook>,
}

impl<T> ParallelEnumerator<T>
where
    T: Send + 'static,
{
    /// 以谓词与获取函数构造。
    pub fn new<P, F, Fut>(has_next: P, fetch: F) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: Fn(EnumerationToken, Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            counter: AtomicU64::new(0),
            items: TokenMap::new(),
            has_next: Arc::new(has_next),
            fetch: Arc::new(move |token, cancel| Box::pin(fetch(token, cancel))),
            dispose: None,
        }
    }

    /// 固定长度的并行枚举：令牌 `k` 对应下标 `k - 1`，共 `len` 个元素。
    ///
    /// 名额计数在谓词中原子领取，并由内置释放钩子在 `reset` 时归零；
    /// 之后再调用 [`with_dispose`](Self::with_dispose) 会替换该钩子，名额将不再复位。
    pub fn from_fn<F, Fut>(len: u64, fetch: F) -> Self
    where
        F: Fn(u64, Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let claimed = Arc::new(AtomicU64::new(0));
        let has_next = {
            let claimed = Arc::clone(&claimed);
            move || {
                claimed
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                        (taken < len).then_some(taken + 1)
                    })
                    .is_ok()
            }
        };
        Self::new(has_next, move |token, cancel| fetch(token.get() - 1, cancel)).with_dispose(
            move |_cancel| {
                claimed.store(0, Ordering::Release);
                async { Ok(()) }
            },
        )
    }

    /// 附加释放钩子。
    pub fn with_dispose<D, Fut>(mut self, dispose: D) -> Self
    where
        D: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispose = Some(Arc::new(move |cancel| Box::pin(dispose(cancel))));
        self
    }

    /// 并行枚举器允许多个步进同时在途。
    pub fn is_parallel_enumeration_supported(&self) -> bool {
        true
    }

    /// 已入表但尚未取回的元素数。
    pub fn pending(&self) -> usize {
        self.items.len()
    }

    /// 发起一次步进。
    ///
    /// # 契约说明（What）
    /// - 谓词为假：返回 `Ok(None)`，不铸造令牌；
    /// - 获取失败：错误原样返回，该令牌作废（不会入表）；
    /// - 获取期间本轮被 `reset` 作废：元素被丢弃，返回 `Ok(None)`；
    /// - 本轮序号用尽：返回 [`EnumerationError::TokensExhausted`]；
    /// - 令牌已在表中：返回 [`EnumerationError::DuplicateToken`]，属于内部缺陷信号。
    pub async fn advance(&self, cancel: &Cancellation) -> Result<Option<EnumerationToken>> {
        cancel.check()?;
        if !(self.has_next)() {
            return Ok(None);
        }
        let word = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & SEQUENCE_MASK < SEQUENCE_MASK).then_some(word + 1)
            })
            .map_err(|word| EnumerationError::TokensExhausted {
                pass: pass_of(word),
            })?
            + 1;
        let token = NonZeroU64::new(word)
            .map(EnumerationToken)
            .ok_or(EnumerationError::DuplicateToken { token: word })?;
        let item = (self.fetch)(token, cancel.child()).await?;
        self.items
            .insert_new(token.key(), item)
            .map_err(|_| EnumerationError::DuplicateToken { token: token.get() })?;

        // 先入表再核对轮次：`reset` 先推进轮次再清表，二者之一必然回收这条旧轮元素。
        if pass_of(self.counter.load(Ordering::SeqCst)) != token.pass() {
            self.items.remove(token.key());
            debug!(%token, "fetch finished after reset; item discarded");
            return Ok(None);
        }
        Ok(Some(token))
    }

    /// 凭令牌取回元素；每个令牌至多成功一次，旧轮令牌取回 `None`。
    pub fn retrieve(&self, token: EnumerationToken) -> Option<T> {
        self.items.remove(token.key())
    }

    /// 复位计数与映射并调用释放钩子。
    ///
    /// 返回值表示本轮是否铸造过令牌；轮次推进先于清表，在途的旧轮步进不会把元素留在新一轮。
    pub async fn reset(&self, cancel: &Cancellation) -> Result<bool> {
        let (Ok(previous) | Err(previous)) =
            self.counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                    Some(((pass_of(word) + 1) & PASS_MASK) << SEQUENCE_BITS)
                });
        let issued = previous & SEQUENCE_MASK;
        let abandoned = self.items.len();
        self.items.clear();
        debug!(issued, abandoned, "parallel enumeration reset");
        if let Some(dispose) = self.dispose.as_ref() {
            dispose(cancel.child()).await?;
        }
        Ok(issued > 0)
    }
}

impl<T> fmt::Debug for ParallelEnumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.counter.load(Ordering::Acquire);
        f.debug_struct("ParallelEnumerator")
            .field("pass", &pass_of(word))
            .field("issued", &(word & SEQUENCE_MASK))
            .field("pending", &self.items.len())
            .field("has_dispose", &self.dispose.is_some())
            .finish()
    }
}
