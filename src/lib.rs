#![doc = include_str!("../README.md")]
// Declare modules
pub mod config;
pub mod element;
pub mod error;
pub mod pmem;
pub mod pool;
pub mod sort;
pub mod storage;
pub mod telemetry;
pub mod tvlist;
pub mod types;

/// Shared, thread-safe cache of fixed-capacity chunks.
pub use crate::pool::ArrayPool;
/// Configuration options for the array pool.
pub use crate::pool::PoolConfig;
/// Point-in-time view of pool activity.
pub use crate::pool::PoolStats;
/// Error type for buffer operations.
pub use crate::error::BufferError;
/// Element kinds a list can hold.
pub use crate::element::Element;
/// Storage media and the chunk abstraction lists are written against.
pub use crate::storage::{Medium, Persistent, Plain, StorageSpace};
/// The chunked, sortable time-value list and its per-kind aliases.
pub use crate::tvlist::{
    BooleanTvList, DoubleTvList, FloatTvList, Int32TvList, Int64TvList, NvmBooleanTvList,
    NvmDoubleTvList, NvmFloatTvList, NvmInt32TvList, NvmInt64TvList, NvmTextTvList, TextTvList,
    TvIter, TvList,
};
/// Structured event hook for observability.
pub use crate::telemetry::{BufferEvent, BufferEventListener};
/// Core value types.
pub use crate::types::{DataType, SeriesKey, TimeValuePair, Timestamp, TsValue};
