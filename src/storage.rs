//! Storage spaces: the fixed-capacity chunks a list is built from, and the two media they live on.

use crate::element::Element;
use crate::error::BufferError;
use crate::pmem::{ChunkOwner, PmemRegion};
use crate::pool::ArrayPool;
use crate::types::{ChunkRole, SeriesKey, Timestamp};

use std::fmt;
use std::marker::PhantomData;

/// A fixed-capacity typed container. Callers guarantee `index < capacity()`.
pub trait StorageSpace<T: Element>: fmt::Debug + Send {
    fn capacity(&self) -> usize;

    fn get(&self, index: usize) -> T;

    fn set(&mut self, index: usize, value: T);

    /// Durability point. Everything `set` so far survives a power loss once this returns.
    fn sync(&self) -> Result<(), BufferError> {
        Ok(())
    }

    /// Declares that only the first `len` slots hold data.
    fn truncate(&mut self, _len: usize) {}
}

/// A chunk backed by an ordinary heap array.
#[derive(Debug)]
pub struct PlainChunk<T> {
    data: Box<[T]>,
}

impl<T: Element> PlainChunk<T> {
    pub(crate) fn new(data: Box<[T]>) -> Self {
        PlainChunk { data }
    }

    pub(crate) fn into_inner(self) -> Box<[T]> {
        self.data
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Element> StorageSpace<T> for PlainChunk<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn get(&self, index: usize) -> T {
        self.data[index].clone()
    }

    #[inline]
    fn set(&mut self, index: usize, value: T) {
        self.data[index] = value;
    }
}

/// A chunk backed by a memory-mapped persistent region.
///
/// Writes land in the mapping directly: they are visible to `get` at once and survive a process
/// crash; `sync` additionally makes them survive a power loss.
#[derive(Debug)]
pub struct PersistentChunk<T> {
    region: PmemRegion,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> PersistentChunk<T> {
    pub(crate) fn new(region: PmemRegion) -> Self {
        PersistentChunk {
            region,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_region(self) -> PmemRegion {
        self.region
    }

    pub fn region_id(&self) -> u64 {
        self.region.id()
    }

    /// Number of leading slots that hold data.
    pub fn committed(&self) -> usize {
        self.region.committed()
    }
}

impl<T: Element> StorageSpace<T> for PersistentChunk<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.region.capacity()
    }

    #[inline]
    fn get(&self, index: usize) -> T {
        T::read_slot(self.region.slot(index))
    }

    #[inline]
    fn set(&mut self, index: usize, value: T) {
        value.write_slot(self.region.slot_mut(index));
        if index >= self.region.committed() {
            self.region.set_committed(index + 1);
        }
    }

    fn sync(&self) -> Result<(), BufferError> {
        self.region.sync()
    }

    fn truncate(&mut self, len: usize) {
        if len < self.region.committed() {
            self.region.set_committed(len);
        }
    }
}

/// The storage medium a list's primary chunks live on, chosen when the list is constructed.
///
/// Chunks move in (timestamp, value) pairs: element `i` of a list needs both chunks at ordinal
/// `i / C`, so a medium acquires, releases and abandons them together.
pub trait Medium: fmt::Debug + Send + Sync + 'static {
    type Chunk<E: Element>: StorageSpace<E>;

    const PERSISTENT: bool;

    /// Fails when `pool` cannot issue chunks of this medium at all.
    fn check_pool(pool: &ArrayPool) -> Result<(), BufferError>;

    /// Whether `value` fits one slot of this medium.
    fn accepts<E: Element>(pool: &ArrayPool, value: &E) -> bool;

    /// Reserves `series` for a new live list.
    fn claim(_pool: &ArrayPool, _series: &SeriesKey) -> Result<(), BufferError> {
        Ok(())
    }

    fn unclaim(_pool: &ArrayPool, _series: &SeriesKey) {}

    /// Acquires the timestamp chunk and the value chunk at `ordinal` of `series`.
    fn acquire_pair<E: Element>(
        pool: &ArrayPool,
        series: &SeriesKey,
        ordinal: usize,
    ) -> Result<(Self::Chunk<Timestamp>, Self::Chunk<E>), BufferError>;

    fn release_pair<E: Element>(
        pool: &ArrayPool,
        times: Vec<Self::Chunk<Timestamp>>,
        values: Vec<Self::Chunk<E>>,
    ) -> Result<(), BufferError>;

    /// Hands back the chunks of a list dropped without an explicit release.
    fn abandon_pair<E: Element>(
        pool: &ArrayPool,
        series: &SeriesKey,
        times: Vec<Self::Chunk<Timestamp>>,
        values: Vec<Self::Chunk<E>>,
    ) -> Result<(), BufferError>;
}

/// Process memory. Dropped lists return their chunks to the pool.
#[derive(Debug, Clone, Copy)]
pub struct Plain;

/// Persistent memory. Dropped lists keep their regions for a later `recover`.
#[derive(Debug, Clone, Copy)]
pub struct Persistent;

fn single<C>(mut chunks: Vec<C>) -> Result<C, BufferError> {
    match (chunks.pop(), chunks.is_empty()) {
        (Some(chunk), true) => Ok(chunk),
        _ => Err(BufferError::Internal(
            "pool returned the wrong number of chunks".to_string(),
        )),
    }
}

impl Medium for Plain {
    type Chunk<E: Element> = PlainChunk<E>;

    const PERSISTENT: bool = false;

    fn check_pool(_pool: &ArrayPool) -> Result<(), BufferError> {
        Ok(())
    }

    #[inline]
    fn accepts<E: Element>(_pool: &ArrayPool, _value: &E) -> bool {
        true
    }

    fn acquire_pair<E: Element>(
        pool: &ArrayPool,
        _series: &SeriesKey,
        _ordinal: usize,
    ) -> Result<(PlainChunk<Timestamp>, PlainChunk<E>), BufferError> {
        let times = pool.acquire_plain::<Timestamp>(1)?;
        let values = match pool.acquire_plain::<E>(1) {
            Ok(v) => v,
            Err(e) => {
                let _ = pool.release_plain(times);
                return Err(e);
            }
        };
        Ok((single(times)?, single(values)?))
    }

    fn release_pair<E: Element>(
        pool: &ArrayPool,
        times: Vec<PlainChunk<Timestamp>>,
        values: Vec<PlainChunk<E>>,
    ) -> Result<(), BufferError> {
        let times_result = pool.release_plain(times);
        let values_result = pool.release_plain(values);
        times_result.and(values_result)
    }

    fn abandon_pair<E: Element>(
        pool: &ArrayPool,
        _series: &SeriesKey,
        times: Vec<PlainChunk<Timestamp>>,
        values: Vec<PlainChunk<E>>,
    ) -> Result<(), BufferError> {
        Self::release_pair(pool, times, values)
    }
}

fn regions_of<E: Element>(
    times: Vec<PersistentChunk<Timestamp>>,
    values: Vec<PersistentChunk<E>>,
) -> Vec<PmemRegion> {
    times
        .into_iter()
        .map(PersistentChunk::into_region)
        .chain(values.into_iter().map(PersistentChunk::into_region))
        .collect()
}

impl Medium for Persistent {
    type Chunk<E: Element> = PersistentChunk<E>;

    const PERSISTENT: bool = true;

    fn check_pool(pool: &ArrayPool) -> Result<(), BufferError> {
        if pool.has_persistent_heap() {
            Ok(())
        } else {
            Err(BufferError::ConfigError(
                "persistent lists need a pool opened with pmem_dir".to_string(),
            ))
        }
    }

    #[inline]
    fn accepts<E: Element>(pool: &ArrayPool, value: &E) -> bool {
        value.encoded_len() <= E::slot_width(pool.config().text_slot_bytes)
    }

    fn claim(pool: &ArrayPool, series: &SeriesKey) -> Result<(), BufferError> {
        pool.claim_series(series)
    }

    fn unclaim(pool: &ArrayPool, series: &SeriesKey) {
        let _ = pool.unclaim_series(series);
    }

    /// Both regions are bound in one registry write.
    fn acquire_pair<E: Element>(
        pool: &ArrayPool,
        series: &SeriesKey,
        ordinal: usize,
    ) -> Result<(PersistentChunk<Timestamp>, PersistentChunk<E>), BufferError> {
        let mut regions = pool.acquire_bound(&[
            (
                Timestamp::DATA_TYPE,
                ChunkOwner::new(series, ChunkRole::Timestamp, ordinal),
            ),
            (
                E::DATA_TYPE,
                ChunkOwner::new(series, ChunkRole::Value, ordinal),
            ),
        ])?;
        let value = regions.pop();
        match (regions.pop(), value) {
            (Some(time), Some(value)) => {
                Ok((PersistentChunk::new(time), PersistentChunk::new(value)))
            }
            _ => Err(BufferError::Internal(
                "pool returned the wrong number of regions".to_string(),
            )),
        }
    }

    /// Both sequences are unbound in one registry write.
    fn release_pair<E: Element>(
        pool: &ArrayPool,
        times: Vec<PersistentChunk<Timestamp>>,
        values: Vec<PersistentChunk<E>>,
    ) -> Result<(), BufferError> {
        let regions = regions_of(times, values);
        if regions.is_empty() {
            return Ok(());
        }
        pool.release_persistent(regions)
    }

    fn abandon_pair<E: Element>(
        pool: &ArrayPool,
        series: &SeriesKey,
        times: Vec<PersistentChunk<Timestamp>>,
        values: Vec<PersistentChunk<E>>,
    ) -> Result<(), BufferError> {
        pool.park_persistent(series, regions_of(times, values))
    }
}
