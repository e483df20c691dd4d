use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type (epoch-relative, unit chosen by the caller).
pub type Timestamp = i64;

/// The closed set of element kinds a time-value list can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Boolean,
        DataType::Int32,
        DataType::Int64,
        DataType::Float,
        DataType::Double,
        DataType::Text,
    ];

    /// One-byte tag used in persistent region headers.
    pub fn tag(self) -> u8 {
        match self {
            DataType::Boolean => 0,
            DataType::Int32 => 1,
            DataType::Int64 => 2,
            DataType::Float => 3,
            DataType::Double => 4,
            DataType::Text => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        DataType::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed value, used at the flush boundary where callers dispatch on type.
#[derive(Debug, Clone, PartialEq)]
pub enum TsValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl TsValue {
    pub fn data_type(&self) -> DataType {
        match self {
            TsValue::Boolean(_) => DataType::Boolean,
            TsValue::Int32(_) => DataType::Int32,
            TsValue::Int64(_) => DataType::Int64,
            TsValue::Float(_) => DataType::Float,
            TsValue::Double(_) => DataType::Double,
            TsValue::Text(_) => DataType::Text,
        }
    }
}

/// A single (timestamp, value) pair read out of a list.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: TsValue,
}

/// Identifies the series a list buffers: (storage group, device, measurement).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub storage_group: String,
    pub device: String,
    pub measurement: String,
}

impl SeriesKey {
    pub fn new(
        storage_group: impl Into<String>,
        device: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        SeriesKey {
            storage_group: storage_group.into(),
            device: device.into(),
            measurement: measurement.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.storage_group, self.device, self.measurement)
    }
}

/// Which of a list's two chunk sequences a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkRole {
    Timestamp,
    Value,
}
