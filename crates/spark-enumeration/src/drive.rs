//! 通用驱动辅助：把“步进 / 取当前 / 结束”协议折叠为常见的消费循环。
//!
//! - 顺序驱动（[`for_each`]、[`collect`]）对任意 [`SequentialEnumeration`] 生效，
//!   无论循环因耗尽、回调失败还是生产者失败而退出，都会调用一次 `end`；
//! - 并行驱动（[`for_each_concurrent`]）以 `FuturesUnordered` 维持有界的在途步进数，
//!   结束后调用 `reset`。元素按完成顺序而非令牌顺序交付。

use std::num::NonZeroUsize;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::{
    contract::Cancellation,
    error::{EnumerationError, Result},
    parallel::{EnumerationToken, ParallelEnumerator},
    traits::SequentialEnumeration,
};

/// 逐个消费元素，返回成功交付给回调的元素数。
///
/// 失败优先级：步进或回调的首个错误优先于 `end` 的错误。
pub async fn for_each<T, E, F>(enumerator: &E, cancel: &Cancellation, mut f: F) -> Result<u64>
where
    T: Send,
    E: SequentialEnumeration<T> + ?Sized,
    F: FnMut(T) -> Result<()>,
{
    let mut delivered = 0_u64;
    let outcome: Result<()> = async {
        while enumerator.advance(cancel).await? {
            if let Some(item) = enumerator.take_current() {
                f(item)?;
                delivered += 1;
            }
        }
        Ok(())
    }
    .await;

    let ended = enumerator.end(cancel).await;
    outcome?;
    ended?;
    Ok(delivered)
}

/// 收集本轮全部元素。
pub async fn collect<T, E>(enumerator: &E, cancel: &Cancellation) -> Result<Vec<T>>
where
    T: Send,
    E: SequentialEnumeration<T> + ?Sized,
{
    let mut items = Vec::new();
    for_each(enumerator, cancel, |item| {
        items.push(item);
        Ok(())
    })
    .await?;
    Ok(items)
}

/// 以至多 `limit` 个在途步进消费并行枚举，返回成功交付给回调的元素数。
///
/// # 契约说明（What）
/// - 首个失败（步进或回调）之后不再发起新的步进，已在途的步进照常收尾；
/// - 无论成败都会调用一次 `reset`，其错误仅在此前没有失败时返回。
pub async fn for_each_concurrent<T, F>(
    enumerator: &ParallelEnumerator<T>,
    limit: NonZeroUsize,
    cancel: &Cancellation,
    mut f: F,
) -> Result<u64>
where
    T: Send + 'static,
    F: FnMut(EnumerationToken, T) -> Result<()>,
{
    let mut in_flight = FuturesUnordered::new();
    for _ in 0..limit.get() {
        in_flight.push(enumerator.advance(cancel));
    }

    let mut delivered = 0_u64;
    let mut exhausted = false;
    let mut failure: Option<EnumerationError> = None;
    while let Some(outcome) = in_flight.next().await {
        match outcome {
            Ok(Some(token)) => {
                if let (Some(item), None) = (enumerator.retrieve(token), failure.as_ref()) {
                    match f(token, item) {
                        Ok(()) => delivered += 1,
                        Err(error) => failure = Some(error),
                    }
                }
                if !exhausted && failure.is_none() {
                    in_flight.push(enumerator.advance(cancel));
                }
            }
            Ok(None) => exhausted = true,
            Err(error) => {
                failure.get_or_insert(error);
            }
        }
    }

    debug!(delivered, failed = failure.is_some(), "parallel drive finished");
    let reset = enumerator.reset(cancel).await;
    if let Some(error) = failure {
        return Err(error);
    }
    reset?;
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{producer::FirstStep, sequential::AsyncEnumerator, state::EnumerationState};
    use futures::executor::block_on;
    use std::io;

    #[test]
    fn for_each_ends_the_pass_when_the_callback_fails() {
        block_on(async {
            let cancel = Cancellation::new();
            let enumerator = AsyncEnumerator::from_vec(vec![1_u32, 2, 3]);
            let mut seen = Vec::new();
            let outcome = for_each(&enumerator, &cancel, |item| {
                seen.push(item);
                if item == 2 {
                    Err(EnumerationError::producer(io::Error::other("stop")))
                } else {
                    Ok(())
                }
            })
            .await;
            assert!(matches!(outcome, Err(EnumerationError::Producer(_))));
            assert_eq!(seen, vec![1, 2]);
            assert_eq!(enumerator.state(), EnumerationState::Initial);
        });
    }

    #[test]
    fn collect_works_through_a_trait_object() {
        block_on(async {
            let boxed: Box<dyn SequentialEnumeration<u8>> =
                Box::new(AsyncEnumerator::from_vec(vec![7, 8]));
            let items = collect(boxed.as_ref(), &Cancellation::new())
                .await
                .expect("collect");
            assert_eq!(items, vec![7, 8]);
        });
    }

    #[test]
    fn collect_propagates_producer_failure() {
        block_on(async {
            let enumerator = AsyncEnumerator::<u8>::new(|_cancel| async {
                Err::<FirstStep<u8>, _>(EnumerationError::producer(io::Error::other("boom")))
            });
            let outcome = collect(&enumerator, &Cancellation::new()).await;
            assert!(matches!(outcome, Err(EnumerationError::Producer(_))));
        });
    }

    #[test]
    fn for_each_concurrent_delivers_every_item_once() {
        block_on(async {
            let enumerator =
                ParallelEnumerator::from_fn(16, |index, _cancel| async move { Ok(index) });
            let mut seen = Vec::new();
            let delivered = for_each_concurrent(
                &enumerator,
                NonZeroUsize::new(4).expect("non-zero"),
                &Cancellation::new(),
                |_token, item| {
                    seen.push(item);
                    Ok(())
                },
            )
            .await
            .expect("drive");
            seen.sort_unstable();
            assert_eq!(delivered, 16);
            assert_eq!(seen, (0..16).collect::<Vec<_>>());
            assert_eq!(enumerator.pending(), 0);
        });
    }
}
