//! 以缓冲读取器为后端的顺序枚举。
//!
//! - [`fixed_records`]：按固定长度切分流；
//! - [`length_delimited_frames`]：大端 `u32` 长度前缀 + 负载。
//!
//! 每一步都先擦除上一条记录，再读取下一条，因此缓冲只保留当前记录与预读。
//! 流在记录边界结束时报告耗尽；在记录中途结束则以
//! [`StreamError::UnexpectedEnd`] 作为生产者失败返回。
//!
//! 提前 `end` 会排空续延链，也就是把流上剩余记录读完并丢弃。

use std::sync::Arc;

use bytes::Bytes;
use spark_enumeration::{AsyncEnumerator, BoxFuture, Cancellation, FirstStep, Step};
use tokio::io::AsyncRead;

use crate::{config::FrameOptions, error::StreamError, reader::StreamReader};

const LENGTH_PREFIX: usize = 4;

type StepFuture = BoxFuture<'static, spark_enumeration::Result<Step<Bytes>>>;

/// 每条记录恰好 `record_len` 字节的枚举；`record_len == 0` 时立即耗尽。
pub fn fixed_records<S>(reader: Arc<StreamReader<S>>, record_len: usize) -> AsyncEnumerator<Bytes>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    AsyncEnumerator::new(move |cancel| {
        let reader = Arc::clone(&reader);
        async move { Ok(FirstStep::new(next_record(reader, record_len, cancel).await?)) }
    })
}

fn next_record<S>(
    reader: Arc<StreamReader<S>>,
    record_len: usize,
    cancel: Cancellation,
) -> StepFuture
where
    S: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async move {
        if record_len == 0 {
            return Ok(Step::Exhausted);
        }
        if !reader.try_read(record_len, &cancel).await? {
            return exhausted_or_truncated(&reader, record_len);
        }
        let record = reader.with_read_bytes(Bytes::copy_from_slice)?;
        Ok(Step::item(record, move |cancel| {
            next_record(reader, record_len, cancel)
        }))
    })
}

/// 长度前缀帧枚举，单帧负载不得超过 `options.max_frame_len()`。
pub fn length_delimited_frames<S>(
    reader: Arc<StreamReader<S>>,
    options: FrameOptions,
) -> AsyncEnumerator<Bytes>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    AsyncEnumerator::new(move |cancel| {
        let reader = Arc::clone(&reader);
        async move { Ok(FirstStep::new(next_frame(reader, options, cancel).await?)) }
    })
}

fn next_frame<S>(
    reader: Arc<StreamReader<S>>,
    options: FrameOptions,
    cancel: Cancellation,
) -> StepFuture
where
    S: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async move {
        if !reader.try_read(LENGTH_PREFIX, &cancel).await? {
            return exhausted_or_truncated(&reader, LENGTH_PREFIX);
        }
        let declared = reader.with_read_bytes(|header| {
            <[u8; LENGTH_PREFIX]>::try_from(header).map(u32::from_be_bytes)
        })?;
        let declared =
            declared.map_err(|_| StreamError::Internal("length prefix not fully buffered"))?;
        let len = usize::try_from(declared).unwrap_or(usize::MAX);
        if len > options.max_frame_len() {
            return Err(StreamError::LimitExceeded {
                requested: u64::from(declared),
                remaining: options.max_frame_len() as u64,
            }
            .into());
        }

        reader.read_more_exact(len, &cancel).await?;
        let frame =
            reader.with_read_bytes(|bytes| Bytes::copy_from_slice(&bytes[LENGTH_PREFIX..]))?;
        Ok(Step::item(frame, move |cancel| next_frame(reader, options, cancel)))
    })
}

/// 流在边界处结束为耗尽，在记录中途结束为截断。
fn exhausted_or_truncated<S>(
    reader: &StreamReader<S>,
    requested: usize,
) -> spark_enumeration::Result<Step<Bytes>>
where
    S: AsyncRead + Unpin,
{
    match reader.read_bytes_count()? {
        0 => Ok(Step::Exhausted),
        available => Err(StreamError::UnexpectedEnd {
            requested,
            available,
        }
        .into()),
    }
}
