//! `parallel_contract` 集成测试：在多线程运行时下验证令牌并行枚举。
//!
//! # 测试目标（Why）
//! - K 个并发步进得到 K 个互不相同的令牌；
//! - 每个令牌恰好能取回一次，第二次取回返回 `None`；
//! - `reset` 恰好调用一次释放钩子，并清空未取回的元素；
//! - 跨越 `reset` 的在途步进不会把旧轮元素带进新一轮。

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use spark_enumeration::{Cancellation, EnumerationToken, ParallelEnumerator};

const K: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_mint_distinct_tokens_retrievable_once() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let enumerator = Arc::new({
        let disposed = Arc::clone(&disposed);
        ParallelEnumerator::new(
            || true,
            |token: EnumerationToken, _cancel| async move {
                tokio::task::yield_now().await;
                Ok(token.get() * 2)
            },
        )
        .with_dispose(move |_cancel| {
            let disposed = Arc::clone(&disposed);
            async move {
                disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    });
    assert!(enumerator.is_parallel_enumeration_supported());

    let mut handles = Vec::with_capacity(K);
    for _ in 0..K {
        let enumerator = Arc::clone(&enumerator);
        handles.push(tokio::spawn(async move {
            enumerator
                .advance(&Cancellation::new())
                .await
                .expect("advance")
                .expect("predicate always true")
        }));
    }

    let mut tokens = HashSet::new();
    for handle in handles {
        assert!(tokens.insert(handle.await.expect("join")));
    }
    assert_eq!(tokens.len(), K);
    assert_eq!(enumerator.pending(), K);

    for token in &tokens {
        assert_eq!(enumerator.retrieve(*token), Some(token.get() * 2));
        assert_eq!(enumerator.retrieve(*token), None);
    }

    assert!(enumerator.reset(&Cancellation::new()).await.expect("reset"));
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn false_predicate_mints_no_token() {
    let open = Arc::new(AtomicBool::new(true));
    let enumerator = {
        let open = Arc::clone(&open);
        ParallelEnumerator::new(
            move || open.load(Ordering::SeqCst),
            |token, _cancel| async move { Ok(token.get()) },
        )
    };
    let cancel = Cancellation::new();
    let token = enumerator.advance(&cancel).await.expect("advance");
    assert!(token.is_some());

    open.store(false, Ordering::SeqCst);
    assert!(enumerator.advance(&cancel).await.expect("advance").is_none());
    assert_eq!(enumerator.pending(), 1);
}

#[tokio::test]
async fn reset_discards_unretrieved_items() {
    let cancel = Cancellation::new();
    let enumerator = ParallelEnumerator::from_fn(3, |index, _cancel| async move { Ok(index) });
    let first = enumerator
        .advance(&cancel)
        .await
        .expect("advance")
        .expect("token");
    enumerator.advance(&cancel).await.expect("advance");
    assert_eq!(enumerator.pending(), 2);

    assert!(enumerator.reset(&cancel).await.expect("reset"));
    assert_eq!(enumerator.pending(), 0);
    assert_eq!(enumerator.retrieve(first), None);
}

#[tokio::test]
async fn cancelled_advance_mints_nothing() {
    let cancel = Cancellation::new();
    cancel.cancel();
    let enumerator =
        ParallelEnumerator::new(|| true, |token, _cancel| async move { Ok(token.get()) });
    assert!(enumerator.advance(&cancel).await.is_err());
    assert!(!enumerator.reset(&Cancellation::new()).await.expect("reset"));
}

#[tokio::test]
async fn fetch_spanning_a_reset_is_discarded() {
    let enumerator = Arc::new(ParallelEnumerator::new(
        || true,
        |token: EnumerationToken, _cancel| async move {
            if token.pass() == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(token.get())
        },
    ));

    let stale = {
        let enumerator = Arc::clone(&enumerator);
        tokio::spawn(async move { enumerator.advance(&Cancellation::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(enumerator.reset(&Cancellation::new()).await.expect("reset"));

    let fresh = enumerator
        .advance(&Cancellation::new())
        .await
        .expect("advance")
        .expect("token");
    assert_eq!((fresh.pass(), fresh.get()), (1, 1));

    let stale = stale.await.expect("join").expect("stale advance");
    assert!(stale.is_none());
    assert_eq!(enumerator.pending(), 1);
    assert_eq!(enumerator.retrieve(fresh), Some(1));
    assert_eq!(enumerator.pending(), 0);
}
