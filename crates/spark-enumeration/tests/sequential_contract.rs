//! `sequential_contract` 集成测试：从外部 crate 视角验证顺序枚举状态机的契约。
//!
//! # 测试目标（Why）
//! - 任意长度的生产者序列都按生产者顺序逐个交付，随后 `advance` 返回 `false`；
//! - `take_current` 每步恰好交付一次；未读元素在下一次步进时被丢弃且永不再出现；
//! - 重叠的两次步进必然有一方得到并发误用错误，而不是阻塞或破坏状态；
//! - 生产者结束通知在自然结束、提前结束与步进中途结束三种路径下都恰好被调用一次。
//!
//! # 结构安排（How）
//! - `CountingProducer`：记录续延调用次数与结束通知次数的测试生产者；
//! - 顺序性质使用 `proptest` 生成任意序列；并发场景使用 `tokio` 定时器制造挂起窗口。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::executor::block_on;
use proptest::prelude::*;
use spark_enumeration::{
    AsyncEnumerator, Cancellation, EnumerationError, EnumerationState, FirstStep, Step,
};

/// 记录生产者侧可观测副作用的计数器。
#[derive(Clone, Default)]
struct CountingProducer {
    continuations: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
}

impl CountingProducer {
    /// 产出 `items` 的枚举器；`delay` 非零时首步会在定时器上挂起。
    fn enumerator(&self, items: Vec<u32>, delay: Duration) -> AsyncEnumerator<u32> {
        let items: Arc<[u32]> = items.into();
        let producer = self.clone();
        AsyncEnumerator::new(move |_cancel| {
            let items = Arc::clone(&items);
            let producer = producer.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let ends = Arc::clone(&producer.ends);
                Ok(FirstStep::new(producer.step(items, 0)).with_end(move |_cancel| async move {
                    ends.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            }
        })
    }

    fn step(&self, items: Arc<[u32]>, index: usize) -> Step<u32> {
        match items.get(index).copied() {
            Some(item) => {
                let producer = self.clone();
                Step::item(item, move |_cancel| async move {
                    producer.continuations.fetch_add(1, Ordering::SeqCst);
                    Ok(producer.step(items, index + 1))
                })
            }
            None => Step::Exhausted,
        }
    }

    fn continuations(&self) -> usize {
        self.continuations.load(Ordering::SeqCst)
    }

    fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

proptest! {
    /// 交替调用 `advance` / `take_current` 恰好按生产者顺序得到全部元素。
    #[test]
    fn items_arrive_in_producer_order(items in proptest::collection::vec(any::<u32>(), 0..48)) {
        let producer = CountingProducer::default();
        let enumerator = producer.enumerator(items.clone(), Duration::ZERO);
        let cancel = Cancellation::new();
        let received = block_on(async {
            let mut received = Vec::new();
            while enumerator.advance(&cancel).await.expect("advance") {
                received.push(enumerator.take_current().expect("current item"));
            }
            assert!(!enumerator.advance(&cancel).await.expect("advance after exhaustion"));
            enumerator.end(&cancel).await.expect("end");
            received
        });
        prop_assert_eq!(received, items);
        prop_assert_eq!(producer.ends(), 1);
        prop_assert_eq!(enumerator.state(), EnumerationState::Initial);
    }
}

#[test]
fn take_current_delivers_each_item_once() {
    block_on(async {
        let cancel = Cancellation::new();
        let enumerator = AsyncEnumerator::from_vec(vec!["alpha".to_owned()]);
        assert!(enumerator.advance(&cancel).await.expect("advance"));
        assert_eq!(enumerator.take_current().as_deref(), Some("alpha"));
        assert_eq!(enumerator.take_current(), None);
        assert_eq!(enumerator.state(), EnumerationState::MoveNextEnded);
    });
}

#[test]
fn advancing_over_an_unread_item_abandons_it() {
    block_on(async {
        let cancel = Cancellation::new();
        let enumerator = AsyncEnumerator::from_vec(vec![10_u32, 20, 30]);
        assert!(enumerator.advance(&cancel).await.expect("first"));
        assert!(enumerator.advance(&cancel).await.expect("second"));
        assert_eq!(enumerator.take_current(), Some(20));
        assert!(enumerator.advance(&cancel).await.expect("third"));
        assert_eq!(enumerator.take_current(), Some(30));
        assert!(!enumerator.advance(&cancel).await.expect("exhausted"));
        assert_eq!(enumerator.take_current(), None);
    });
}

#[tokio::test]
async fn overlapping_advance_is_rejected_as_concurrent_use() {
    let producer = CountingProducer::default();
    let enumerator = producer.enumerator(vec![1, 2], Duration::from_millis(30));
    let cancel = Cancellation::new();

    let (first, second) = tokio::join!(enumerator.advance(&cancel), enumerator.advance(&cancel));
    assert!(first.expect("first advance owns the step"));
    match second {
        Err(EnumerationError::ConcurrentUse { operation, state }) => {
            assert_eq!(operation, "advance");
            assert_eq!(state, EnumerationState::MoveNextStarted);
        }
        other => panic!("expected concurrent use, got {other:?}"),
    }
    assert_eq!(enumerator.take_current(), Some(1));
}

#[test]
fn abrupt_end_drains_the_chain_and_notifies_once() {
    block_on(async {
        let cancel = Cancellation::new();
        let producer = CountingProducer::default();
        let enumerator = producer.enumerator(vec![1, 2, 3, 4, 5], Duration::ZERO);

        assert!(enumerator.advance(&cancel).await.expect("first"));
        assert_eq!(enumerator.take_current(), Some(1));
        assert!(enumerator.advance(&cancel).await.expect("second"));
        assert_eq!(producer.continuations(), 1);

        assert!(enumerator.end(&cancel).await.expect("abrupt end"));
        // 续延链被走完：剩余 3 个元素 + 1 次耗尽报告。
        assert_eq!(producer.continuations(), 5);
        assert_eq!(producer.ends(), 1);
        assert_eq!(enumerator.state(), EnumerationState::Initial);
        assert!(!enumerator.end(&cancel).await.expect("end from initial"));
        assert_eq!(producer.ends(), 1);
    });
}

#[test]
fn natural_end_notifies_once_and_allows_a_fresh_pass() {
    block_on(async {
        let cancel = Cancellation::new();
        let producer = CountingProducer::default();
        let enumerator = producer.enumerator(vec![7, 8], Duration::ZERO);

        for pass in 1..=2 {
            let mut received = Vec::new();
            while enumerator.advance(&cancel).await.expect("advance") {
                received.extend(enumerator.take_current());
            }
            assert!(enumerator.end(&cancel).await.expect("end"));
            assert_eq!(received, vec![7, 8]);
            assert_eq!(producer.ends(), pass);
        }
    });
}

#[tokio::test]
async fn end_during_an_in_flight_advance_still_notifies_once() {
    let producer = CountingProducer::default();
    let enumerator = producer.enumerator(vec![1, 2, 3], Duration::from_millis(30));
    let cancel = Cancellation::new();

    let (advanced, ended) = tokio::join!(enumerator.advance(&cancel), enumerator.end(&cancel));
    assert!(ended.expect("end takes over the pass"));
    assert!(matches!(advanced, Err(ref error) if error.is_concurrent_use()));
    assert_eq!(producer.ends(), 1);
    assert_eq!(enumerator.state(), EnumerationState::Initial);
}

#[test]
fn producer_failure_propagates_and_end_recovers_the_instance() {
    block_on(async {
        let cancel = Cancellation::new();
        let enumerator = AsyncEnumerator::<u32>::new(|_cancel| async {
            Ok(FirstStep::new(Step::item(1, |_cancel| async {
                Err(EnumerationError::producer(std::io::Error::other("disk gone")))
            })))
        });
        assert!(enumerator.advance(&cancel).await.expect("first"));
        let failure = enumerator.advance(&cancel).await.expect_err("second fails");
        assert!(failure.to_string().contains("disk gone"));
        assert!(enumerator.end(&cancel).await.expect("end resets"));
        assert!(enumerator.advance(&cancel).await.expect("fresh pass"));
    });
}

type EventLog = Arc<parking_lot::Mutex<Vec<String>>>;

/// 产出 `0..len` 的枚举器：每个续延都在定时器上挂起 `delay`，并把起止与结束通知写入日志。
fn slow_chain(len: u32, delay: Duration, log: EventLog) -> AsyncEnumerator<u32> {
    AsyncEnumerator::new(move |_cancel| {
        let log = Arc::clone(&log);
        async move {
            let end_log = Arc::clone(&log);
            Ok(
                FirstStep::new(chain_step(0, len, delay, log)).with_end(move |_cancel| async move {
                    end_log.lock().push("dispose".to_owned());
                    Ok(())
                }),
            )
        }
    })
}

fn chain_step(index: u32, len: u32, delay: Duration, log: EventLog) -> Step<u32> {
    if index >= len {
        return Step::Exhausted;
    }
    Step::item(index, move |_cancel| async move {
        log.lock().push(format!("cont {index} start"));
        tokio::time::sleep(delay).await;
        log.lock().push(format!("cont {index} done"));
        Ok(chain_step(index + 1, len, delay, log))
    })
}

#[tokio::test]
async fn end_during_a_later_advance_drains_the_rest_before_notifying() {
    let log = EventLog::default();
    let enumerator = slow_chain(5, Duration::from_millis(40), Arc::clone(&log));
    let cancel = Cancellation::new();

    assert!(enumerator.advance(&cancel).await.expect("first"));
    assert_eq!(enumerator.take_current(), Some(0));

    let (advanced, ended) = tokio::join!(enumerator.advance(&cancel), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        enumerator.end(&cancel).await
    });
    assert!(matches!(
        advanced,
        Err(EnumerationError::ConcurrentUse {
            state: EnumerationState::Resetting,
            ..
        })
    ));
    assert!(ended.expect("end winds the pass down"));

    let log = log.lock().clone();
    let finished = log.iter().filter(|entry| entry.ends_with("done")).count();
    assert_eq!(finished, 5, "every remaining continuation runs: {log:?}");
    assert_eq!(log.last().map(String::as_str), Some("dispose"));
    assert_eq!(log.iter().filter(|entry| *entry == "dispose").count(), 1);
    assert_eq!(enumerator.take_current(), None);
    assert_eq!(enumerator.state(), EnumerationState::Initial);
}

#[tokio::test]
async fn new_pass_is_rejected_until_a_racing_end_has_wound_down() {
    let producer = CountingProducer::default();
    let enumerator = producer.enumerator(vec![1, 2], Duration::from_millis(40));
    let cancel = Cancellation::new();

    let (advanced, ended, fresh) = tokio::join!(
        enumerator.advance(&cancel),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            enumerator.end(&cancel).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(15)).await;
            enumerator.advance(&cancel).await
        },
    );
    assert!(advanced.expect_err("ended pass").is_concurrent_use());
    assert!(ended.expect("end"));
    assert!(matches!(
        fresh,
        Err(EnumerationError::ConcurrentUse {
            state: EnumerationState::Resetting,
            ..
        })
    ));
    assert_eq!(enumerator.take_current(), None);
    assert_eq!(enumerator.state(), EnumerationState::Initial);
    assert_eq!(producer.ends(), 1);

    assert!(enumerator.advance(&cancel).await.expect("new pass"));
    assert_eq!(enumerator.take_current(), Some(1));
}

#[tokio::test]
async fn dropped_advance_does_not_stall_end() {
    let producer = CountingProducer::default();
    let enumerator = producer.enumerator(vec![1], Duration::from_millis(200));
    let cancel = Cancellation::new();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(5), enumerator.advance(&cancel)).await;
    assert!(timed_out.is_err());
    assert_eq!(enumerator.state(), EnumerationState::MoveNextStarted);

    let ended = tokio::time::timeout(Duration::from_millis(100), enumerator.end(&cancel))
        .await
        .expect("end does not wait for a dropped advance");
    assert!(ended.expect("end"));
    assert_eq!(enumerator.state(), EnumerationState::Initial);
}

#[tokio::test]
async fn advance_hook_skips_items_of_an_ended_pass() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);
    let enumerator = slow_chain(3, Duration::from_millis(30), EventLog::default())
        .with_advance_hook(Arc::new(move |item: &u32| hook_seen.lock().push(*item)));
    let cancel = Cancellation::new();

    assert!(enumerator.advance(&cancel).await.expect("first"));
    let (advanced, ended) = tokio::join!(enumerator.advance(&cancel), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        enumerator.end(&cancel).await
    });
    assert!(advanced.is_err());
    assert!(ended.expect("end"));
    assert_eq!(*seen.lock(), vec![0]);
}
