//! # StreamReader：分块、可受限、可嵌套的缓冲读取器
//!
//! ## 核心意图（Why）
//! - 为解析器提供“确保前方有 N 个字节”的异步原语，底层按配置的块大小向流要数据，缓冲按需增长；
//! - 通过受限子读取器把一段定长区域交给下层解析器，而不复制缓冲。
//!
//! ## 缓冲模型（What）
//! - 缓冲从偏移 0 开始，前 `read_bytes_count` 个字节是已交付给调用方的区域，其后是预读；
//! - 每个读取器（根或子）对应一个视图：已交付计数、已擦除计数、字节预算与待排空余量；
//!   视图按嵌套深度压栈，只有栈顶视图可以操作共享缓冲；
//! - 创建子读取器前父视图先擦除已交付区域，因此子视图也从偏移 0 开始；父视图的预读若落在子区域内，
//!   子读取器直接使用，不会重复向流要数据。
//!
//! ## 子读取器释放（How）
//! - `Drop`：丢弃子区域内仍在缓冲中的字节；仍留在流上的余量记入父视图，父读取器进入
//!   `WaitingForInnerRemainder`，由其下一次操作惰性排空；
//! - [`LimitedReader::dispose`]：同样的折叠，但立即排空余量。
//!
//! ## 风险提示（Trade-offs）
//! - 单消费者对象：并发调用以 [`StreamError::Busy`] 失败，而非排队；
//! - 读取器内部以 `tokio::sync::Mutex` 承载缓冲，但只在独占标记领取成功后 `try_lock`，从不等待锁。

use std::cmp;

use bytes::{Buf, BufMut, BytesMut};
use spark_enumeration::Cancellation;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex as AsyncMutex, MutexGuard},
};
use tracing::{debug, trace, warn};

use crate::{
    config::ReaderOptions,
    error::{Result, StreamError, ensure_active},
    gate::{Claim, Gate, StreamState},
};

/// 单个读取器在共享缓冲上的记账。
#[derive(Clone, Copy, Debug)]
struct View {
    /// 从缓冲起点算起、已交付给调用方的字节数。
    read: usize,
    /// 本视图已从缓冲中擦除的字节数（计入预算）。
    erased: u64,
    limit: Option<u64>,
    /// 已释放子读取器留在流上、须先丢弃的字节数。
    pending_skip: u64,
}

impl View {
    const fn new(limit: Option<u64>) -> Self {
        Self {
            read: 0,
            erased: 0,
            limit,
            pending_skip: 0,
        }
    }

    /// 尚未擦除的预算（含已交付与未交付部分）。
    fn budget_left(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.erased))
    }
}

struct ReaderCore<S> {
    stream: S,
    buffer: BytesMut,
    stream_ended: bool,
    views: Vec<View>,
}

impl<S> ReaderCore<S> {
    /// 栈顶视图可见的有效字节数。
    fn available(&self, depth: usize) -> usize {
        let len = self.buffer.len();
        match self.views[depth].budget_left() {
            Some(left) => cmp::min(len as u64, left) as usize,
            None => len,
        }
    }

    /// 擦除已交付区域。
    fn compact(&mut self, depth: usize) {
        let view = &mut self.views[depth];
        if view.read > 0 {
            self.buffer.advance(view.read);
            view.erased += view.read as u64;
            view.read = 0;
        }
    }
}

impl<S> ReaderCore<S>
where
    S: AsyncRead + Unpin,
{
    /// 向流读取一个块；返回读到的字节数，0 表示流结束。
    async fn read_chunk(&mut self, want: usize, cancel: &Cancellation) -> Result<usize> {
        ensure_active(cancel)?;
        self.buffer.reserve(want);
        let received = self
            .stream
            .read_buf(&mut (&mut self.buffer).limit(want))
            .await?;
        if received == 0 {
            self.stream_ended = true;
        }
        trace!(requested = want, received, "reader chunk");
        Ok(received)
    }

    /// 读取直到栈顶视图可见 `target` 个字节、流结束或预算耗尽。
    async fn fill(
        &mut self,
        depth: usize,
        target: usize,
        chunk_size: usize,
        cancel: &Cancellation,
    ) -> Result<()> {
        while self.available(depth) < target && !self.stream_ended {
            let room = match self.views[depth].budget_left() {
                Some(left) => left.saturating_sub(self.buffer.len() as u64),
                None => u64::MAX,
            };
            if room == 0 {
                break;
            }
            let want = cmp::min(chunk_size as u64, room) as usize;
            self.read_chunk(want, cancel).await?;
        }
        Ok(())
    }

    /// 丢弃视图上登记的流上余量；流提前结束时余量作废。
    async fn discard_pending(
        &mut self,
        depth: usize,
        chunk_size: usize,
        cancel: &Cancellation,
    ) -> Result<u64> {
        let mut drained = 0_u64;
        while self.views[depth].pending_skip > 0 {
            if self.stream_ended {
                self.views[depth].pending_skip = 0;
                break;
            }
            let keep = self.buffer.len();
            let want = cmp::min(chunk_size as u64, self.views[depth].pending_skip) as usize;
            let received = self.read_chunk(want, cancel).await?;
            self.buffer.truncate(keep);
            self.views[depth].pending_skip -= received as u64;
            drained += received as u64;
        }
        Ok(drained)
    }
}

/// 某一深度的读取器视角：共享缓冲 + 本层独占标记。
struct Frame<'r, S> {
    core: &'r AsyncMutex<ReaderCore<S>>,
    gate: &'r Gate,
    depth: usize,
    chunk_size: usize,
}

impl<'r, S> Frame<'r, S> {
    fn enter(
        &self,
        operation: &'static str,
    ) -> Result<(Claim<'r>, MutexGuard<'r, ReaderCore<S>>)> {
        let claim = self.gate.claim(operation)?;
        let core = self
            .core
            .try_lock()
            .map_err(|_| StreamError::Internal("reader buffer locked while its gate was free"))?;
        if core.views.len() != self.depth + 1 {
            return Err(StreamError::Internal(
                "reader view stack does not match the active reader",
            ));
        }
        Ok((claim, core))
    }

    fn erase_consumed(&self) -> Result<()> {
        let (_claim, mut core) = self.enter("erase_consumed")?;
        core.compact(self.depth);
        Ok(())
    }

    fn erase_segment(&self, start: usize, count: usize) -> Result<()> {
        let (_claim, mut guard) = self.enter("erase_segment")?;
        let core = &mut *guard;
        let read = core.views[self.depth].read;
        let end = start.checked_add(count).filter(|end| *end <= read).ok_or(
            StreamError::OutOfRange {
                start,
                end: start.saturating_add(count),
                available: read,
            },
        )?;
        let mut tail = core.buffer.split_off(start);
        tail.advance(end - start);
        core.buffer.unsplit(tail);
        let view = &mut core.views[self.depth];
        view.read -= count;
        view.erased += count as u64;
        Ok(())
    }

    fn unread(&self, count: usize) -> Result<()> {
        let (_claim, mut core) = self.enter("unread")?;
        let view = &mut core.views[self.depth];
        view.read = view
            .read
            .checked_sub(count)
            .ok_or(StreamError::OutOfRange {
                start: 0,
                end: count,
                available: view.read,
            })?;
        Ok(())
    }

    fn with_read_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (_claim, core) = self.enter("with_read_bytes")?;
        let read = core.views[self.depth].read;
        Ok(f(&core.buffer[..read]))
    }

    fn read_bytes_count(&self) -> Result<usize> {
        let (_claim, core) = self.enter("read_bytes_count")?;
        Ok(core.views[self.depth].read)
    }

    fn buffered_ahead(&self) -> Result<usize> {
        let (_claim, core) = self.enter("buffered_ahead")?;
        Ok(core.available(self.depth) - core.views[self.depth].read)
    }
}

impl<'r, S> Frame<'r, S>
where
    S: AsyncRead + Unpin,
{
    /// 排空本层登记的流上余量，并把释放后的状态改回 `Idle`。
    async fn settle(
        &self,
        claim: &mut Claim<'r>,
        core: &mut ReaderCore<S>,
        cancel: &Cancellation,
    ) -> Result<()> {
        if core.views[self.depth].pending_skip > 0 {
            let drained = core
                .discard_pending(self.depth, self.chunk_size, cancel)
                .await?;
            debug!(
                depth = self.depth,
                drained,
                resumed_from = ?claim.claimed_from(),
                "deferred sub-reader remainder drained"
            );
        }
        claim.release_to(StreamState::Idle);
        Ok(())
    }

    /// 返回（是否凑齐，交付后的已读计数）。
    async fn read_up_to(
        &self,
        operation: &'static str,
        count: usize,
        keep_read: bool,
        cancel: &Cancellation,
    ) -> Result<(bool, usize)> {
        let (mut claim, mut guard) = self.enter(operation)?;
        let core = &mut *guard;
        self.settle(&mut claim, core, cancel).await?;
        if !keep_read {
            core.compact(self.depth);
        }
        let target = core.views[self.depth].read.saturating_add(count);
        core.fill(self.depth, target, self.chunk_size, cancel).await?;
        let available = core.available(self.depth);
        let delivered = cmp::min(target, available);
        core.views[self.depth].read = delivered;
        Ok((available >= target, delivered))
    }

    async fn try_read(&self, count: usize, cancel: &Cancellation) -> Result<bool> {
        Ok(self.read_up_to("try_read", count, false, cancel).await?.0)
    }

    async fn try_read_more(&self, count: usize, cancel: &Cancellation) -> Result<bool> {
        Ok(self.read_up_to("try_read_more", count, true, cancel).await?.0)
    }

    async fn read_exact(&self, count: usize, cancel: &Cancellation) -> Result<()> {
        match self.read_up_to("read_exact", count, false, cancel).await? {
            (true, _) => Ok(()),
            (false, delivered) => Err(StreamError::UnexpectedEnd {
                requested: count,
                available: delivered,
            }),
        }
    }

    async fn read_more_exact(&self, count: usize, cancel: &Cancellation) -> Result<()> {
        let (mut claim, mut guard) = self.enter("read_more_exact")?;
        let core = &mut *guard;
        self.settle(&mut claim, core, cancel).await?;
        let already = core.views[self.depth].read;
        let target = already.saturating_add(count);
        core.fill(self.depth, target, self.chunk_size, cancel).await?;
        let available = core.available(self.depth);
        core.views[self.depth].read = cmp::min(target, available);
        if available < target {
            return Err(StreamError::UnexpectedEnd {
                requested: count,
                available: available - already,
            });
        }
        Ok(())
    }

    async fn skip(&self, count: usize, cancel: &Cancellation) -> Result<()> {
        let (mut claim, mut guard) = self.enter("skip")?;
        let core = &mut *guard;
        self.settle(&mut claim, core, cancel).await?;
        core.compact(self.depth);
        let mut remaining = count;
        while remaining > 0 {
            core.fill(
                self.depth,
                cmp::min(remaining, self.chunk_size),
                self.chunk_size,
                cancel,
            )
            .await?;
            let step = cmp::min(core.available(self.depth), remaining);
            if step == 0 {
                return Err(StreamError::UnexpectedEnd {
                    requested: count,
                    available: count - remaining,
                });
            }
            core.buffer.advance(step);
            core.views[self.depth].erased += step as u64;
            remaining -= step;
        }
        Ok(())
    }

    async fn sub_reader(&self, limit: u64, cancel: &Cancellation) -> Result<LimitedReader<'r, S>> {
        let (mut claim, mut guard) = self.enter("create_limited_sub_reader")?;
        let core = &mut *guard;
        self.settle(&mut claim, core, cancel).await?;
        core.compact(self.depth);
        if let Some(left) = core.views[self.depth].budget_left()
            && limit > left
        {
            return Err(StreamError::LimitExceeded {
                requested: limit,
                remaining: left,
            });
        }
        core.views.push(View::new(Some(limit)));
        claim.release_to(StreamState::InnerActive);
        debug!(
            depth = self.depth + 1,
            limit,
            buffered = core.buffer.len(),
            "limited sub-reader created"
        );
        Ok(LimitedReader {
            core: self.core,
            parent_gate: self.gate,
            gate: Gate::new(),
            depth: self.depth + 1,
            limit,
            chunk_size: self.chunk_size,
            released: false,
        })
    }
}

/// 为根读取器与子读取器生成同一组公开操作。
macro_rules! reader_operations {
    () => {
        /// 擦除已交付字节，然后确保前方有 `count` 个新字节；返回是否凑齐。
        ///
        /// 流结束时返回 `false`，已读到的部分仍可通过 [`with_read_bytes`](Self::with_read_bytes) 查看。
        pub async fn try_read(&self, count: usize, cancel: &Cancellation) -> Result<bool> {
            self.frame().try_read(count, cancel).await
        }

        /// 保留已交付字节，在其后追加 `count` 个字节；返回是否凑齐。
        pub async fn try_read_more(&self, count: usize, cancel: &Cancellation) -> Result<bool> {
            self.frame().try_read_more(count, cancel).await
        }

        /// 严格版 `try_read`：凑不齐时返回 [`StreamError::UnexpectedEnd`]。
        pub async fn read_exact(&self, count: usize, cancel: &Cancellation) -> Result<()> {
            self.frame().read_exact(count, cancel).await
        }

        /// 严格版 `try_read_more`。
        pub async fn read_more_exact(&self, count: usize, cancel: &Cancellation) -> Result<()> {
            self.frame().read_more_exact(count, cancel).await
        }

        /// 擦除已交付字节后再丢弃 `count` 个字节。
        pub async fn skip(&self, count: usize, cancel: &Cancellation) -> Result<()> {
            self.frame().skip(count, cancel).await
        }

        /// 擦除已交付区域，已读计数归零。
        pub fn erase_consumed(&self) -> Result<()> {
            self.frame().erase_consumed()
        }

        /// 从已交付区域中删除 `[start, start + count)`，后续字节前移。
        pub fn erase_segment(&self, start: usize, count: usize) -> Result<()> {
            self.frame().erase_segment(start, count)
        }

        /// 把已读标记回退 `count` 个字节，这些字节会被下一次读取重新交付。
        pub fn unread(&self, count: usize) -> Result<()> {
            self.frame().unread(count)
        }

        /// 借用已交付区域。
        pub fn with_read_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
            self.frame().with_read_bytes(f)
        }

        /// 已交付字节数。
        pub fn read_bytes_count(&self) -> Result<usize> {
            self.frame().read_bytes_count()
        }

        /// 已缓冲但尚未交付的字节数（受限读取器只计预算内部分）。
        pub fn buffered_ahead(&self) -> Result<usize> {
            self.frame().buffered_ahead()
        }

        /// 切出至多 `limit` 字节的子读取器；子读取器存活期间本读取器的操作均以 `Busy` 失败。
        pub async fn create_limited_sub_reader(
            &self,
            limit: u64,
            cancel: &Cancellation,
        ) -> Result<LimitedReader<'_, S>> {
            self.frame().sub_reader(limit, cancel).await
        }

        /// 当前独占状态。
        pub fn state(&self) -> StreamState {
            self.gate.load()
        }
    };
}

/// 根缓冲读取器，独占底层流。
pub struct StreamReader<S> {
    core: AsyncMutex<ReaderCore<S>>,
    gate: Gate,
    options: ReaderOptions,
}

impl<S> StreamReader<S>
where
    S: AsyncRead + Unpin,
{
    /// 以默认配置包装流。
    pub fn new(stream: S) -> Self {
        Self::with_options(stream, ReaderOptions::default())
    }

    pub fn with_options(stream: S, options: ReaderOptions) -> Self {
        Self::build(stream, None, options)
    }

    /// 至多交付 `limit` 字节的根读取器，不会向流多要任何字节。
    pub fn limited(stream: S, limit: u64, options: ReaderOptions) -> Self {
        Self::build(stream, Some(limit), options)
    }

    fn build(stream: S, limit: Option<u64>, options: ReaderOptions) -> Self {
        Self {
            core: AsyncMutex::new(ReaderCore {
                stream,
                buffer: BytesMut::with_capacity(options.initial_capacity()),
                stream_ended: false,
                views: vec![View::new(limit)],
            }),
            gate: Gate::new(),
            options,
        }
    }

    fn frame(&self) -> Frame<'_, S> {
        Frame {
            core: &self.core,
            gate: &self.gate,
            depth: 0,
            chunk_size: self.options.chunk_size(),
        }
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// 拆出底层流与尚未擦除的缓冲内容。
    pub fn into_parts(self) -> (S, BytesMut) {
        let core = self.core.into_inner();
        (core.stream, core.buffer)
    }

    reader_operations!();
}

impl<S> std::fmt::Debug for StreamReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("state", &self.gate.load())
            .field("options", &self.options)
            .finish()
    }
}

/// 共享父缓冲、至多交付 `limit` 字节的子读取器。
pub struct LimitedReader<'a, S> {
    core: &'a AsyncMutex<ReaderCore<S>>,
    parent_gate: &'a Gate,
    gate: Gate,
    depth: usize,
    limit: u64,
    chunk_size: usize,
    released: bool,
}

impl<'a, S> LimitedReader<'a, S>
where
    S: AsyncRead + Unpin,
{
    fn frame(&self) -> Frame<'_, S> {
        Frame {
            core: self.core,
            gate: &self.gate,
            depth: self.depth,
            chunk_size: self.chunk_size,
        }
    }

    /// 本读取器的字节预算。
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// 嵌套深度（根读取器为 0）。
    pub fn depth(&self) -> usize {
        self.depth
    }

    reader_operations!();

    /// 释放子读取器并立即排空其留在流上的余量。
    ///
    /// 失败时余量仍登记在父读取器上，由父读取器下一次操作继续排空。
    pub async fn dispose(mut self, cancel: &Cancellation) -> Result<u64> {
        let Some(shortfall) = self.detach() else {
            return Err(StreamError::Internal("sub-reader could not be folded into its parent"));
        };
        if shortfall == 0 {
            return Ok(0);
        }
        let parent = Frame {
            core: self.core,
            gate: self.parent_gate,
            depth: self.depth - 1,
            chunk_size: self.chunk_size,
        };
        let (mut claim, mut guard) = parent.enter("dispose")?;
        parent.settle(&mut claim, &mut guard, cancel).await?;
        Ok(shortfall)
    }
}

impl<S> LimitedReader<'_, S> {
    /// 把本视图折叠回父视图，返回留在流上、须由父读取器丢弃的字节数。
    fn detach(&mut self) -> Option<u64> {
        if self.released {
            return None;
        }
        self.released = true;

        let Ok(mut guard) = self.core.try_lock() else {
            warn!(depth = self.depth, "sub-reader released while its buffer was locked");
            return None;
        };
        let core = &mut *guard;
        if core.views.len() != self.depth + 1 {
            warn!(depth = self.depth, "sub-reader released out of nesting order");
            return None;
        }
        let view = core.views.pop()?;

        let remaining = self.limit.saturating_sub(view.erased);
        let in_buffer = cmp::min(core.buffer.len() as u64, remaining);
        core.buffer.advance(in_buffer as usize);
        let shortfall = view.pending_skip + (remaining - in_buffer);

        let parent = core.views.last_mut()?;
        parent.erased += self.limit;
        parent.pending_skip += shortfall;
        self.parent_gate.store(if parent.pending_skip > 0 {
            StreamState::WaitingForInnerRemainder
        } else {
            StreamState::Idle
        });
        debug!(
            depth = self.depth,
            delivered = view.erased + view.read as u64,
            discarded_buffered = in_buffer,
            deferred = shortfall,
            "limited sub-reader released"
        );
        Some(shortfall)
    }
}

impl<S> Drop for LimitedReader<'_, S> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<S> std::fmt::Debug for LimitedReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedReader")
            .field("depth", &self.depth)
            .field("limit", &self.limit)
            .field("state", &self.gate.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unread_rewinds_and_the_next_read_redelivers() {
        let cancel = Cancellation::new();
        let reader = StreamReader::new(&b"abcdef"[..]);
        reader.read_exact(4, &cancel).await.expect("read");
        reader.unread(2).expect("unread");
        assert_eq!(reader.read_bytes_count().expect("count"), 2);
        reader.try_read_more(2, &cancel).await.expect("read more");
        assert_eq!(
            reader.with_read_bytes(<[u8]>::to_vec).expect("view"),
            b"abcd".to_vec()
        );
        assert!(reader.unread(5).is_err());
    }

    #[tokio::test]
    async fn erase_segment_closes_the_gap() {
        let cancel = Cancellation::new();
        let reader = StreamReader::new(&b"0123456789"[..]);
        reader.read_exact(6, &cancel).await.expect("read");
        reader.erase_segment(1, 3).expect("erase");
        assert_eq!(
            reader.with_read_bytes(<[u8]>::to_vec).expect("view"),
            b"045".to_vec()
        );
        assert!(matches!(
            reader.erase_segment(2, 5),
            Err(StreamError::OutOfRange { .. })
        ));
        reader.try_read_more(1, &cancel).await.expect("read more");
        assert_eq!(
            reader.with_read_bytes(<[u8]>::to_vec).expect("view"),
            b"0456".to_vec()
        );
    }

    #[tokio::test]
    async fn limited_root_never_delivers_past_its_budget() {
        let cancel = Cancellation::new();
        let reader = StreamReader::limited(&b"abcdef"[..], 4, ReaderOptions::default());
        assert!(!reader.try_read(5, &cancel).await.expect("read"));
        assert_eq!(reader.read_bytes_count().expect("count"), 4);
        let (rest, buffered) = reader.into_parts();
        assert_eq!(rest, b"ef");
        assert_eq!(&buffered[..], b"abcd");
    }
}
