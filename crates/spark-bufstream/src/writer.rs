//! # StreamWriter：可受限、可嵌套的缓冲写入器
//!
//! ## 核心意图（Why）
//! - 让编码器先在缓冲中预留区段、就地填写，再一次性写入底层流；
//! - 受限子写入器把一段定长区域交给下层编码器，未写满的部分在释放时补零，
//!   保证外层格式中声明的长度始终成立。
//!
//! ## 行为契约（What）
//! - `reserve_segment(count)` 返回 `(offset, granted)`，`granted` 受剩余预算约束；
//!   `offset` 从首个未封存字节起算，与 `with_reserved_mut` 看到的切片对齐；
//! - `unreserve_segment(count)` 归还尾部已预留未提交的字节；子写入器补零的区域不可归还；
//! - `flush` 把缓冲写入流：不受限写入器每次都冲刷底层流，受限写入器只在预算恰好用尽时冲刷；
//! - 创建子写入器前先把父缓冲写入流。
//!
//! ## 风险提示（Trade-offs）
//! - `Drop` 无法执行异步 IO：子写入器的补零只进入共享缓冲，随父写入器下一次 `flush` 落盘；
//!   需要立即落盘时调用 [`LimitedWriter::finish`]。

use std::cmp;

use bytes::BytesMut;
use spark_enumeration::Cancellation;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, MutexGuard},
};
use tracing::{debug, trace, warn};

use crate::{
    config::WriterOptions,
    error::{Result, StreamError, ensure_active},
    gate::{Claim, Gate, StreamState},
};

#[derive(Clone, Copy, Debug)]
struct WriterView {
    limit: Option<u64>,
    /// 已写入底层流（或由子写入器代为写入）的字节数。
    written: u64,
}

impl WriterView {
    const fn new(limit: Option<u64>) -> Self {
        Self { limit, written: 0 }
    }

    fn budget_left(&self, buffered: usize) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.written + buffered as u64))
    }
}

struct WriterCore<S> {
    stream: S,
    buffer: BytesMut,
    /// 缓冲前部由已释放子写入器提交、不可归还的字节数。
    sealed: usize,
    views: Vec<WriterView>,
}

impl<S> WriterCore<S>
where
    S: AsyncWrite + Unpin,
{
    /// 写出缓冲；按预算策略决定是否冲刷底层流。
    async fn write_out(&mut self, depth: usize, cancel: &Cancellation) -> Result<usize> {
        let pending = self.buffer.len();
        if pending > 0 {
            ensure_active(cancel)?;
            self.stream.write_all(&self.buffer).await?;
            self.buffer.clear();
            self.sealed = 0;
            self.views[depth].written += pending as u64;
            trace!(depth, written = pending, "writer buffer written");
        }

        let view = self.views[depth];
        let exhausted = view.limit.is_some_and(|limit| view.written >= limit);
        if view.limit.is_none() || exhausted {
            ensure_active(cancel)?;
            self.stream.flush().await?;
        }
        Ok(pending)
    }
}

struct Frame<'w, S> {
    core: &'w AsyncMutex<WriterCore<S>>,
    gate: &'w Gate,
    depth: usize,
}

impl<'w, S> Frame<'w, S> {
    fn enter(
        &self,
        operation: &'static str,
    ) -> Result<(Claim<'w>, MutexGuard<'w, WriterCore<S>>)> {
        let claim = self.gate.claim(operation)?;
        let core = self
            .core
            .try_lock()
            .map_err(|_| StreamError::Internal("writer buffer locked while its gate was free"))?;
        if core.views.len() != self.depth + 1 {
            return Err(StreamError::Internal(
                "writer view stack does not match the active writer",
            ));
        }
        Ok((claim, core))
    }

    fn reserve_segment(&self, count: usize) -> Result<(usize, usize)> {
        let (_claim, mut guard) = self.enter("reserve_segment")?;
        let core = &mut *guard;
        let len = core.buffer.len();
        let granted = match core.views[self.depth].budget_left(len) {
            Some(left) => cmp::min(count as u64, left) as usize,
            None => count,
        };
        core.buffer.resize(len + granted, 0);
        Ok((len - core.sealed, granted))
    }

    fn unreserve_segment(&self, count: usize) -> Result<()> {
        let (_claim, mut guard) = self.enter("unreserve_segment")?;
        let core = &mut *guard;
        let len = core.buffer.len();
        let returnable = len - core.sealed;
        if count > returnable {
            return Err(StreamError::OutOfRange {
                start: len.saturating_sub(count),
                end: len,
                available: returnable,
            });
        }
        core.buffer.truncate(len - count);
        Ok(())
    }

    fn append(&self, data: &[u8]) -> Result<()> {
        let (_claim, mut guard) = self.enter("append")?;
        let core = &mut *guard;
        if let Some(left) = core.views[self.depth].budget_left(core.buffer.len())
            && data.len() as u64 > left
        {
            return Err(StreamError::LimitExceeded {
                requested: data.len() as u64,
                remaining: left,
            });
        }
        core.buffer.extend_from_slice(data);
        Ok(())
    }

    fn with_reserved_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let (_claim, mut guard) = self.enter("with_reserved_mut")?;
        let core = &mut *guard;
        Ok(f(&mut core.buffer[core.sealed..]))
    }

    fn pending_len(&self) -> Result<usize> {
        let (_claim, core) = self.enter("pending_len")?;
        Ok(core.buffer.len())
    }

    fn remaining_budget(&self) -> Result<Option<u64>> {
        let (_claim, core) = self.enter("remaining_budget")?;
        Ok(core.views[self.depth].budget_left(core.buffer.len()))
    }
}

impl<'w, S> Frame<'w, S>
where
    S: AsyncWrite + Unpin,
{
    async fn flush(&self, cancel: &Cancellation) -> Result<usize> {
        let (_claim, mut guard) = self.enter("flush")?;
        guard.write_out(self.depth, cancel).await
    }

    async fn sub_writer(&self, limit: u64, cancel: &Cancellation) -> Result<LimitedWriter<'w, S>> {
        let (mut claim, mut guard) = self.enter("create_limited_sub_writer")?;
        let core = &mut *guard;
        core.write_out(self.depth, cancel).await?;
        if let Some(left) = core.views[self.depth].budget_left(0)
            && limit > left
        {
            return Err(StreamError::LimitExceeded {
                requested: limit,
                remaining: left,
            });
        }
        core.views.push(WriterView::new(Some(limit)));
        claim.release_to(StreamState::InnerActive);
        debug!(depth = self.depth + 1, limit, "limited sub-writer created");
        Ok(LimitedWriter {
            core: self.core,
            parent_gate: self.gate,
            gate: Gate::new(),
            depth: self.depth + 1,
            limit,
            released: false,
        })
    }
}

macro_rules! writer_operations {
    () => {
        /// 在缓冲尾部预留至多 `count` 个零字节，返回 `(offset, granted)`。
        ///
        /// `offset` 从首个未封存字节起算；已释放子写入器提交的补零区不计入。
        pub fn reserve_segment(&self, count: usize) -> Result<(usize, usize)> {
            self.frame().reserve_segment(count)
        }

        /// 归还尾部 `count` 个已预留未提交的字节。
        pub fn unreserve_segment(&self, count: usize) -> Result<()> {
            self.frame().unreserve_segment(count)
        }

        /// 追加整段数据；超出剩余预算时整段拒绝。
        pub fn append(&self, data: &[u8]) -> Result<()> {
            self.frame().append(data)
        }

        /// 以可变切片访问未封存的缓冲，偏移与 `reserve_segment` 返回值一致。
        ///
        /// 已释放子写入器提交的字节不可见，只能随下一次 `flush` 原样写出。
        pub fn with_reserved_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
            self.frame().with_reserved_mut(f)
        }

        /// 尚未写出的字节数。
        pub fn pending_len(&self) -> Result<usize> {
            self.frame().pending_len()
        }

        /// 剩余字节预算；不受限写入器返回 `None`。
        pub fn remaining_budget(&self) -> Result<Option<u64>> {
            self.frame().remaining_budget()
        }

        /// 把缓冲写入底层流，返回写出的字节数。
        pub async fn flush(&self, cancel: &Cancellation) -> Result<usize> {
            self.frame().flush(cancel).await
        }

        /// 先写出本层缓冲，再切出至多 `limit` 字节的子写入器。
        pub async fn create_limited_sub_writer(
            &self,
            limit: u64,
            cancel: &Cancellation,
        ) -> Result<LimitedWriter<'_, S>> {
            self.frame().sub_writer(limit, cancel).await
        }

        /// 当前独占状态。
        pub fn state(&self) -> StreamState {
            self.gate.load()
        }
    };
}

/// 根缓冲写入器，独占底层流。
pub struct StreamWriter<S> {
    core: AsyncMutex<WriterCore<S>>,
    gate: Gate,
}

impl<S> StreamWriter<S>
where
    S: AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_options(stream, WriterOptions::default())
    }

    pub fn with_options(stream: S, options: WriterOptions) -> Self {
        Self::build(stream, None, options)
    }

    /// 至多接受 `limit` 字节的根写入器。
    pub fn limited(stream: S, limit: u64, options: WriterOptions) -> Self {
        Self::build(stream, Some(limit), options)
    }

    fn build(stream: S, limit: Option<u64>, options: WriterOptions) -> Self {
        Self {
            core: AsyncMutex::new(WriterCore {
                stream,
                buffer: BytesMut::with_capacity(options.initial_capacity()),
                sealed: 0,
                views: vec![WriterView::new(limit)],
            }),
            gate: Gate::new(),
        }
    }

    fn frame(&self) -> Frame<'_, S> {
        Frame {
            core: &self.core,
            gate: &self.gate,
            depth: 0,
        }
    }

    /// 拆出底层流与尚未写出的缓冲。
    pub fn into_parts(self) -> (S, BytesMut) {
        let core = self.core.into_inner();
        (core.stream, core.buffer)
    }

    writer_operations!();
}

impl<S> std::fmt::Debug for StreamWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("state", &self.gate.load())
            .finish()
    }
}

/// 共享父缓冲、恰好占用 `limit` 字节的子写入器。
pub struct LimitedWriter<'a, S> {
    core: &'a AsyncMutex<WriterCore<S>>,
    parent_gate: &'a Gate,
    gate: Gate,
    depth: usize,
    limit: u64,
    released: bool,
}

impl<'a, S> LimitedWriter<'a, S>
where
    S: AsyncWrite + Unpin,
{
    fn frame(&self) -> Frame<'_, S> {
        Frame {
            core: self.core,
            gate: &self.gate,
            depth: self.depth,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    writer_operations!();

    /// 补零、写出并冲刷底层流，然后把控制权交还父写入器；返回最后一次写出的字节数。
    pub async fn finish(mut self, cancel: &Cancellation) -> Result<usize> {
        let written = {
            let frame = self.frame();
            let (_claim, mut guard) = frame.enter("finish")?;
            let core = &mut *guard;
            let padding = pad_to_limit(core, self.depth);
            if padding > 0 {
                debug!(depth = self.depth, padding, "sub-writer padded before finish");
            }
            core.write_out(self.depth, cancel).await?
        };
        self.detach();
        Ok(written)
    }
}

/// 把栈顶视图未用完的预算补零，返回补零字节数。
fn pad_to_limit<S>(core: &mut WriterCore<S>, depth: usize) -> u64 {
    let padding = core.views[depth]
        .budget_left(core.buffer.len())
        .unwrap_or(0);
    let len = core.buffer.len();
    core.buffer.resize(len + padding as usize, 0);
    padding
}

impl<S> LimitedWriter<'_, S> {
    fn detach(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let Ok(mut guard) = self.core.try_lock() else {
            warn!(depth = self.depth, "sub-writer released while its buffer was locked");
            return;
        };
        let core = &mut *guard;
        if core.views.len() != self.depth + 1 {
            warn!(depth = self.depth, "sub-writer released out of nesting order");
            return;
        }
        let padding = pad_to_limit(core, self.depth);
        core.sealed = core.buffer.len();
        let Some(view) = core.views.pop() else {
            return;
        };
        if let Some(parent) = core.views.last_mut() {
            parent.written += view.written;
        }
        self.parent_gate.store(StreamState::Idle);
        debug!(
            depth = self.depth,
            written = view.written,
            padding,
            "limited sub-writer released"
        );
    }
}

impl<S> Drop for LimitedWriter<'_, S> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<S> std::fmt::Debug for LimitedWriter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedWriter")
            .field("depth", &self.depth)
            .field("limit", &self.limit)
            .field("state", &self.gate.load())
            .finish()
    }
}
