//! Per-type glue: everything a list, the pool and the persistent heap need to know about one
//! element kind.

use crate::types::{DataType, TsValue};
use std::fmt;

/// An idle array held by the pool's free lists, tagged by element kind.
#[derive(Debug)]
pub enum PooledArray {
    Boolean(Box<[bool]>),
    Int32(Box<[i32]>),
    Int64(Box<[i64]>),
    Float(Box<[f32]>),
    Double(Box<[f64]>),
    Text(Box<[String]>),
}

impl PooledArray {
    pub fn data_type(&self) -> DataType {
        match self {
            PooledArray::Boolean(_) => DataType::Boolean,
            PooledArray::Int32(_) => DataType::Int32,
            PooledArray::Int64(_) => DataType::Int64,
            PooledArray::Float(_) => DataType::Float,
            PooledArray::Double(_) => DataType::Double,
            PooledArray::Text(_) => DataType::Text,
        }
    }
}

/// An element kind storable in a time-value list.
///
/// Fixed-width kinds occupy `size_of::<Self>()` bytes in a persistent slot (little endian).
/// Text occupies a configurable slot: a u32 length followed by the UTF-8 bytes.
pub trait Element: Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    /// Bytes per slot when stored in a persistent region.
    fn slot_width(text_slot_bytes: usize) -> usize;

    /// Bytes this value needs in a persistent slot.
    fn encoded_len(&self) -> usize;

    fn write_slot(&self, slot: &mut [u8]);

    fn read_slot(slot: &[u8]) -> Self;

    fn into_value(self) -> TsValue;

    fn into_pooled(array: Box<[Self]>) -> PooledArray;

    /// Gives the array back when it holds a different kind.
    fn from_pooled(array: PooledArray) -> Result<Box<[Self]>, PooledArray>;

    /// Drops anything the array owns on the heap before it goes idle.
    fn scrub(_array: &mut [Self]) {}
}

/// Persistent slot width for a kind known only at runtime.
pub fn slot_width_of(data_type: DataType, text_slot_bytes: usize) -> usize {
    match data_type {
        DataType::Boolean => bool::slot_width(text_slot_bytes),
        DataType::Int32 => i32::slot_width(text_slot_bytes),
        DataType::Int64 => i64::slot_width(text_slot_bytes),
        DataType::Float => f32::slot_width(text_slot_bytes),
        DataType::Double => f64::slot_width(text_slot_bytes),
        DataType::Text => String::slot_width(text_slot_bytes),
    }
}

macro_rules! fixed_width_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$variant;

            #[inline]
            fn slot_width(_text_slot_bytes: usize) -> usize {
                std::mem::size_of::<$ty>()
            }

            #[inline]
            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            #[inline]
            fn write_slot(&self, slot: &mut [u8]) {
                slot[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_slot(slot: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(&slot[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(bytes)
            }

            fn into_value(self) -> TsValue {
                TsValue::$variant(self)
            }

            fn into_pooled(array: Box<[Self]>) -> PooledArray {
                PooledArray::$variant(array)
            }

            fn from_pooled(array: PooledArray) -> Result<Box<[Self]>, PooledArray> {
                match array {
                    PooledArray::$variant(a) => Ok(a),
                    other => Err(other),
                }
            }
        }
    };
}

fixed_width_element!(i32, Int32);
fixed_width_element!(i64, Int64);
fixed_width_element!(f32, Float);
fixed_width_element!(f64, Double);

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Boolean;

    #[inline]
    fn slot_width(_text_slot_bytes: usize) -> usize {
        1
    }

    #[inline]
    fn encoded_len(&self) -> usize {
        1
    }

    #[inline]
    fn write_slot(&self, slot: &mut [u8]) {
        slot[0] = *self as u8;
    }

    #[inline]
    fn read_slot(slot: &[u8]) -> Self {
        slot[0] != 0
    }

    fn into_value(self) -> TsValue {
        TsValue::Boolean(self)
    }

    fn into_pooled(array: Box<[Self]>) -> PooledArray {
        PooledArray::Boolean(array)
    }

    fn from_pooled(array: PooledArray) -> Result<Box<[Self]>, PooledArray> {
        match array {
            PooledArray::Boolean(a) => Ok(a),
            other => Err(other),
        }
    }
}

const TEXT_LEN_PREFIX: usize = 4;

impl Element for String {
    const DATA_TYPE: DataType = DataType::Text;

    fn slot_width(text_slot_bytes: usize) -> usize {
        text_slot_bytes
    }

    fn encoded_len(&self) -> usize {
        TEXT_LEN_PREFIX + self.len()
    }

    fn write_slot(&self, slot: &mut [u8]) {
        let bytes = self.as_bytes();
        slot[..TEXT_LEN_PREFIX].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        slot[TEXT_LEN_PREFIX..TEXT_LEN_PREFIX + bytes.len()].copy_from_slice(bytes);
    }

    fn read_slot(slot: &[u8]) -> Self {
        let mut len_bytes = [0u8; TEXT_LEN_PREFIX];
        len_bytes.copy_from_slice(&slot[..TEXT_LEN_PREFIX]);
        // Clamp so a torn slot cannot index past its end.
        let len = (u32::from_le_bytes(len_bytes) as usize).min(slot.len() - TEXT_LEN_PREFIX);
        String::from_utf8_lossy(&slot[TEXT_LEN_PREFIX..TEXT_LEN_PREFIX + len]).into_owned()
    }

    fn into_value(self) -> TsValue {
        TsValue::Text(self)
    }

    fn into_pooled(array: Box<[Self]>) -> PooledArray {
        PooledArray::Text(array)
    }

    fn from_pooled(array: PooledArray) -> Result<Box<[Self]>, PooledArray> {
        match array {
            PooledArray::Text(a) => Ok(a),
            other => Err(other),
        }
    }

    fn scrub(array: &mut [Self]) {
        for s in array.iter_mut() {
            *s = String::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_round_trip<T: Element>(value: T, text_slot_bytes: usize) -> T {
        let mut slot = vec![0u8; T::slot_width(text_slot_bytes)];
        value.write_slot(&mut slot);
        T::read_slot(&slot)
    }

    #[test]
    fn test_fixed_width_slots() {
        assert_eq!(slot_round_trip(-7i32, 0), -7);
        assert_eq!(slot_round_trip(i64::MIN, 0), i64::MIN);
        assert_eq!(slot_round_trip(1.5f32, 0), 1.5);
        assert_eq!(slot_round_trip(f64::MAX, 0), f64::MAX);
        assert!(slot_round_trip(true, 0));
        assert_eq!(<f64 as Element>::slot_width(256), 8);
    }

    #[test]
    fn test_text_slot_respects_prefix() {
        let s = "temperature=21.5".to_string();
        assert_eq!(s.encoded_len(), 4 + s.len());
        assert_eq!(slot_round_trip(s.clone(), 64), s);
        assert_eq!(slot_round_trip(String::new(), 8), "");
    }

    #[test]
    fn test_torn_text_slot_is_clamped() {
        let mut slot = vec![0u8; 8];
        slot[..4].copy_from_slice(&1000u32.to_le_bytes());
        slot[4..8].copy_from_slice(b"abcd");
        assert_eq!(String::read_slot(&slot), "abcd");
    }

    #[test]
    fn test_pooled_kind_mismatch_returns_array() {
        let pooled = f32::into_pooled(vec![0.0f32; 4].into_boxed_slice());
        assert_eq!(pooled.data_type(), DataType::Float);
        let back = f64::from_pooled(pooled);
        assert!(matches!(back, Err(PooledArray::Float(_))));
    }

    #[test]
    fn test_scrub_clears_text() {
        let mut arr = vec!["a".to_string(), "bc".to_string()];
        String::scrub(&mut arr);
        assert!(arr.iter().all(|s| s.is_empty()));
    }
}
