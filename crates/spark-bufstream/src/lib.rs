//! # spark-bufstream
//!
//! ## 定位与职责（Why）
//! - 为异步字节流提供非阻塞、分块、可受限的缓冲读写原语，解析器与编码器只需关心
//!   “确保前方有 N 字节”与“预留 N 字节”；
//! - 通过共享缓冲的子读取器 / 子写入器，把定长区域交给下层组件处理而不复制数据；
//! - 在 `spark-enumeration` 之上提供以流为后端的记录与帧枚举。
//!
//! ## 架构嵌入（Where）
//! - `reader` / `writer`：根读写器与受限子读写器，独占标记见 `gate`；
//! - `records`：`fixed_records` 与 `length_delimited_frames`；
//! - `config`：读写器与帧枚举的构造期配置；
//! - `error`：统一错误域，可转换为枚举引擎的生产者失败。
//!
//! ## Feature 策略（Trade-offs）
//! - `serde`：为配置结构派生序列化能力，默认关闭以保持依赖最小。

pub mod config;
pub mod error;
mod gate;
pub mod reader;
pub mod records;
pub mod writer;

pub use config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN, FrameOptions, ReaderOptions, WriterOptions,
};
pub use error::{Result, StreamError};
pub use gate::StreamState;
pub use reader::{LimitedReader, StreamReader};
pub use records::{fixed_records, length_delimited_frames};
pub use spark_enumeration::Cancellation;
pub use writer::{LimitedWriter, StreamWriter};
