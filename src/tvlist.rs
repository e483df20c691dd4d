//! Typed time-value lists: the chunked, sortable write buffer of one series.
//!
//! Element `i` lives at offset `i % C` of chunk `i / C` in both the timestamp and the value
//! sequence, where `C` is the pool's array size. Chunks come from the [`ArrayPool`] the list was
//! created with and go back to it on `clear`, `release` or drop.

use crate::element::Element;
use crate::error::BufferError;
use crate::pmem::PmemRegion;
use crate::pool::ArrayPool;
use crate::sort::{sort_range, ScratchSpace, SortHooks};
use crate::storage::{Medium, Persistent, PersistentChunk, Plain, StorageSpace};
use crate::telemetry::{buffer_metrics, BufferEvent};
use crate::types::{ChunkRole, DataType, SeriesKey, TimeValuePair, Timestamp};

use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Instant;

/// A chunked sequence of (timestamp, value) pairs of one element kind on one storage medium.
///
/// Owned by a single writer: every mutating call takes `&mut self` and no internal lock guards the
/// chunks. Only the pool behind it is shared.
pub struct TvList<T: Element, M: Medium = Plain> {
    pool: Arc<ArrayPool>,
    series: SeriesKey,
    timestamps: Vec<M::Chunk<Timestamp>>,
    values: Vec<M::Chunk<T>>,
    size: usize,
    min_time: Timestamp,
    sorted: bool,
    released: bool,
}

pub type BooleanTvList = TvList<bool>;
pub type Int32TvList = TvList<i32>;
pub type Int64TvList = TvList<i64>;
pub type FloatTvList = TvList<f32>;
pub type DoubleTvList = TvList<f64>;
pub type TextTvList = TvList<String>;

pub type NvmBooleanTvList = TvList<bool, Persistent>;
pub type NvmInt32TvList = TvList<i32, Persistent>;
pub type NvmInt64TvList = TvList<i64, Persistent>;
pub type NvmFloatTvList = TvList<f32, Persistent>;
pub type NvmDoubleTvList = TvList<f64, Persistent>;
pub type NvmTextTvList = TvList<String, Persistent>;

impl<T: Element, M: Medium> fmt::Debug for TvList<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TvList")
            .field("series", &self.series)
            .field("data_type", &T::DATA_TYPE)
            .field("persistent", &M::PERSISTENT)
            .field("size", &self.size)
            .field("chunks", &self.timestamps.len())
            .field("min_time", &self.min_time)
            .field("sorted", &self.sorted)
            .field("released", &self.released)
            .finish()
    }
}

impl<T: Element, M: Medium> TvList<T, M> {
    /// Creates an empty list. No chunk is acquired until the first `put`.
    ///
    /// A persistent list holds its series exclusively: this fails with `InvalidState` while
    /// another live list holds it, or while chunks of an earlier list of the series wait for
    /// [`TvList::recover`].
    pub fn new(pool: Arc<ArrayPool>, series: SeriesKey) -> Result<Self, BufferError> {
        M::check_pool(&pool)?;
        M::claim(&pool, &series)?;
        Ok(Self::empty(pool, series))
    }

    fn empty(pool: Arc<ArrayPool>, series: SeriesKey) -> Self {
        TvList {
            pool,
            series,
            timestamps: Vec::new(),
            values: Vec::new(),
            size: 0,
            min_time: Timestamp::MAX,
            sorted: true,
            released: false,
        }
    }

    pub fn series(&self) -> &SeriesKey {
        &self.series
    }

    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    pub fn is_persistent(&self) -> bool {
        M::PERSISTENT
    }

    pub fn pool(&self) -> &Arc<ArrayPool> {
        &self.pool
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Smallest timestamp appended so far, `Timestamp::MAX` when empty.
    #[inline]
    pub fn min_time(&self) -> Timestamp {
        self.min_time
    }

    #[inline]
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn chunk_count(&self) -> usize {
        self.timestamps.len()
    }

    #[inline]
    fn array_size(&self) -> usize {
        self.pool.array_size()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.timestamps.len() * self.array_size()
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        let c = self.array_size();
        (index / c, index % c)
    }

    #[inline]
    fn time_at(&self, index: usize) -> Timestamp {
        let (c, o) = self.locate(index);
        self.timestamps[c].get(o)
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.released {
            return Err(BufferError::InvalidState(format!(
                "time-value list for {} has been released",
                self.series
            )));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), BufferError> {
        self.ensure_live()?;
        if index >= self.size {
            return Err(BufferError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Grows by one timestamp chunk and one value chunk when the list is full.
    fn check_expansion(&mut self) -> Result<(), BufferError> {
        if self.size < self.capacity() {
            return Ok(());
        }
        let (times, values) =
            M::acquire_pair::<T>(&self.pool, &self.series, self.timestamps.len())?;
        self.timestamps.push(times);
        self.values.push(values);
        Ok(())
    }

    /// Appends one pair. A timestamp older than the current last one clears the sorted flag.
    pub fn put(&mut self, timestamp: Timestamp, value: T) -> Result<(), BufferError> {
        self.ensure_live()?;
        if !M::accepts(&self.pool, &value) {
            return Err(BufferError::ResourceExhausted(format!(
                "{} value of {} bytes does not fit a {}-byte persistent slot",
                T::DATA_TYPE,
                value.encoded_len(),
                T::slot_width(self.pool.config().text_slot_bytes)
            )));
        }
        self.check_expansion()?;

        let previous_last = if self.sorted && self.size > 0 {
            Some(self.time_at(self.size - 1))
        } else {
            None
        };

        self.min_time = self.min_time.min(timestamp);
        let (c, o) = self.locate(self.size);
        // Value first: on persistent media the timestamp chunk's committed length marks the
        // element as present.
        self.values[c].set(o, value);
        self.timestamps[c].set(o, timestamp);
        self.size += 1;

        if let Some(last) = previous_last {
            if timestamp < last {
                self.sorted = false;
            }
        }
        buffer_metrics::record_points_appended(1);
        Ok(())
    }

    /// Appends `timestamps[i], values[i]` for `i` in `start..end`, in order. Not atomic: a
    /// failure part-way leaves the earlier elements appended.
    pub fn put_batch(
        &mut self,
        timestamps: &[Timestamp],
        values: &[T],
        start: usize,
        end: usize,
    ) -> Result<(), BufferError> {
        self.ensure_live()?;
        let available = timestamps.len().min(values.len());
        if start > end || end > available {
            return Err(BufferError::IndexOutOfRange {
                index: end,
                size: available,
            });
        }
        for i in start..end {
            self.put(timestamps[i], values[i].clone())?;
        }
        Ok(())
    }

    /// Appends every pair of two equally long slices.
    pub fn put_all(&mut self, timestamps: &[Timestamp], values: &[T]) -> Result<(), BufferError> {
        if timestamps.len() != values.len() {
            return Err(BufferError::IndexOutOfRange {
                index: timestamps.len().max(values.len()),
                size: timestamps.len().min(values.len()),
            });
        }
        self.put_batch(timestamps, values, 0, timestamps.len())
    }

    pub fn get(&self, index: usize) -> Result<(Timestamp, T), BufferError> {
        self.check_index(index)?;
        let (c, o) = self.locate(index);
        Ok((self.timestamps[c].get(o), self.values[c].get(o)))
    }

    pub fn get_time(&self, index: usize) -> Result<Timestamp, BufferError> {
        self.check_index(index)?;
        Ok(self.time_at(index))
    }

    pub fn get_value(&self, index: usize) -> Result<T, BufferError> {
        self.check_index(index)?;
        let (c, o) = self.locate(index);
        Ok(self.values[c].get(o))
    }

    /// The pair at `index` with a dynamically typed value.
    pub fn get_pair(&self, index: usize) -> Result<TimeValuePair, BufferError> {
        let (timestamp, value) = self.get(index)?;
        Ok(TimeValuePair {
            timestamp,
            value: value.into_value(),
        })
    }

    /// Timestamp of the most recently appended element.
    pub fn last_time(&self) -> Result<Option<Timestamp>, BufferError> {
        self.ensure_live()?;
        Ok(self.size.checked_sub(1).map(|i| self.time_at(i)))
    }

    /// Largest timestamp held. Scans unless the list is sorted.
    pub fn max_time(&self) -> Result<Option<Timestamp>, BufferError> {
        self.ensure_live()?;
        if self.sorted {
            return self.last_time();
        }
        Ok((0..self.size).map(|i| self.time_at(i)).max())
    }

    /// Reorders the list by timestamp. A no-op on a sorted list.
    ///
    /// The elements are staged into pooled plain scratch chunks, sorted there, and written back
    /// in one pass, so each primary slot is written once. If scratch cannot be acquired the list
    /// is left untouched and `ResourceExhausted` is returned.
    pub fn sort(&mut self) -> Result<(), BufferError> {
        self.ensure_live()?;
        if self.sorted {
            return Ok(());
        }
        let started = Instant::now();
        let pool = Arc::clone(&self.pool);
        let mut scratch = ScratchSpace::<T>::stage(&pool, self.size)?;

        for i in 0..self.size {
            let (c, o) = self.locate(i);
            scratch.write(i, self.timestamps[c].get(o), self.values[c].get(o));
        }

        sort_range(&mut scratch, 0, self.size);

        for i in 0..self.size {
            let (c, o) = self.locate(i);
            self.values[c].set(o, scratch.value_at(i));
            self.timestamps[c].set(o, scratch.time_at(i));
        }
        drop(scratch);
        self.sorted = true;
        self.sync()?;

        let duration = started.elapsed();
        buffer_metrics::record_sort(duration, self.size as u64);
        self.pool.emit(BufferEvent::ListSorted {
            series: self.series.to_string(),
            points: self.size,
            duration,
        });
        Ok(())
    }

    /// Iterates in current order.
    pub fn iter(&self) -> Result<TvIter<'_, T, M>, BufferError> {
        self.ensure_live()?;
        Ok(TvIter {
            list: self,
            next: 0,
        })
    }

    /// Sorts if needed, then iterates in time order.
    pub fn sorted_iter(&mut self) -> Result<TvIter<'_, T, M>, BufferError> {
        self.sort()?;
        self.iter()
    }

    /// Deep copy into fresh plain chunks, whatever medium this list lives on.
    pub fn clone_list(&self) -> Result<TvList<T, Plain>, BufferError> {
        self.ensure_live()?;
        let chunk_count = self.timestamps.len();
        let mut times = self.pool.acquire_plain::<Timestamp>(chunk_count)?;
        let mut values = match self.pool.acquire_plain::<T>(chunk_count) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.pool.release_plain(times);
                return Err(e);
            }
        };

        for i in 0..self.size {
            let (c, o) = self.locate(i);
            times[c].as_mut_slice()[o] = self.timestamps[c].get(o);
            values[c].as_mut_slice()[o] = self.values[c].get(o);
        }

        let mut copy = TvList::<T, Plain>::empty(Arc::clone(&self.pool), self.series.clone());
        copy.timestamps = times;
        copy.values = values;
        copy.size = self.size;
        copy.min_time = self.min_time;
        copy.sorted = self.sorted;
        Ok(copy)
    }

    /// Removes every element with `lower <= timestamp <= upper`, compacting in place and
    /// returning emptied chunks to the pool. Returns how many elements were removed.
    pub fn delete_range(
        &mut self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<usize, BufferError> {
        self.ensure_live()?;
        let mut kept = 0;
        let mut new_min = Timestamp::MAX;
        for i in 0..self.size {
            let (c, o) = self.locate(i);
            let time = self.timestamps[c].get(o);
            if lower <= time && time <= upper {
                continue;
            }
            if kept != i {
                let value = self.values[c].get(o);
                let (dc, d) = self.locate(kept);
                self.values[dc].set(d, value);
                self.timestamps[dc].set(d, time);
            }
            new_min = new_min.min(time);
            kept += 1;
        }

        let removed = self.size - kept;
        if removed == 0 {
            return Ok(0);
        }

        let array_size = self.array_size();
        let needed = kept.div_ceil(array_size);
        let times_tail = self.timestamps.split_off(needed);
        let values_tail = self.values.split_off(needed);
        if needed > 0 {
            let tail_len = kept - (needed - 1) * array_size;
            if let Some(last) = self.timestamps.last_mut() {
                last.truncate(tail_len);
            }
            if let Some(last) = self.values.last_mut() {
                last.truncate(tail_len);
            }
        }
        self.size = kept;
        self.min_time = new_min;

        M::release_pair(&self.pool, times_tail, values_tail)?;
        self.sync()?;
        Ok(removed)
    }

    /// Returns every chunk to the pool and empties the list; it stays usable.
    pub fn clear(&mut self) -> Result<(), BufferError> {
        self.ensure_live()?;
        let chunks = self.timestamps.len() + self.values.len();
        self.size = 0;
        self.min_time = Timestamp::MAX;
        self.sorted = true;
        self.release_chunks()?;
        self.pool.emit(BufferEvent::ListCleared {
            series: self.series.to_string(),
            chunks,
        });
        Ok(())
    }

    /// Returns every chunk to the pool. Any later call other than the plain getters fails with
    /// `InvalidState`.
    pub fn release(&mut self) -> Result<(), BufferError> {
        self.ensure_live()?;
        let chunks = self.timestamps.len() + self.values.len();
        self.released = true;
        self.size = 0;
        let result = self.release_chunks();
        M::unclaim(&self.pool, &self.series);
        match &result {
            Ok(()) => self.pool.emit(BufferEvent::ListReleased {
                series: self.series.to_string(),
                chunks,
            }),
            Err(e) => self.pool.emit(BufferEvent::ListReleaseFailed {
                series: self.series.to_string(),
                error: e.to_string(),
            }),
        }
        result
    }

    fn release_chunks(&mut self) -> Result<(), BufferError> {
        let times = std::mem::take(&mut self.timestamps);
        let values = std::mem::take(&mut self.values);
        M::release_pair(&self.pool, times, values)
    }

    /// Durability point: flushes every primary chunk. No-op for plain lists.
    pub fn sync(&self) -> Result<(), BufferError> {
        self.ensure_live()?;
        if !M::PERSISTENT {
            return Ok(());
        }
        for chunk in &self.timestamps {
            chunk.sync()?;
        }
        for chunk in &self.values {
            chunk.sync()?;
        }
        Ok(())
    }
}

/// Timestamp and value chunks of a persistent list, in ordinal order.
type ChunkPairs<T> = (Vec<PersistentChunk<Timestamp>>, Vec<PersistentChunk<T>>);

impl<T: Element> TvList<T, Persistent> {
    /// Rebuilds a persistent list from the regions the pool holds for `series`: those found in
    /// the registry when the heap was opened, or left behind by a dropped list.
    ///
    /// Returns an empty list when nothing is held for `series`. Size comes from the committed
    /// lengths of the timestamp chunks; `min_time` and the sorted flag are recomputed by a scan.
    /// A trailing chunk without its partner holds no committed element and goes back to the
    /// pool. Fails with `InvalidState` while a live list holds `series`.
    pub fn recover(pool: Arc<ArrayPool>, series: SeriesKey) -> Result<Self, BufferError> {
        Persistent::check_pool(&pool)?;
        pool.claim_series_for_recovery(&series)?;
        match Self::rebuild(&pool, &series) {
            Ok((timestamps, values)) => Ok(Self::from_chunks(pool, series, timestamps, values)),
            Err(e) => {
                pool.unclaim_series(&series)?;
                Err(e)
            }
        }
    }

    /// Takes the parked regions of `series` and lays them out as paired sequences. On failure
    /// every region is parked again.
    fn rebuild(pool: &ArrayPool, series: &SeriesKey) -> Result<ChunkPairs<T>, BufferError> {
        let owned = pool.take_parked(series)?;

        let mut times: Vec<(u32, PmemRegion)> = Vec::new();
        let mut values: Vec<(u32, PmemRegion)> = Vec::new();
        for (owner, region) in owned {
            match owner.role {
                ChunkRole::Timestamp => times.push((owner.ordinal, region)),
                ChunkRole::Value => values.push((owner.ordinal, region)),
            }
        }
        times.sort_by_key(|(ordinal, _)| *ordinal);
        values.sort_by_key(|(ordinal, _)| *ordinal);

        let pairs = match validate_layout::<T>(&times, &values, pool.array_size()) {
            Ok(pairs) => pairs,
            Err(details) => {
                let regions = times.into_iter().chain(values).map(|(_, r)| r).collect();
                pool.park_persistent(series, regions)?;
                return Err(BufferError::corruption(
                    format!("cannot recover {}: {}", series, details),
                    None,
                ));
            }
        };

        let unpaired: Vec<PmemRegion> = times
            .split_off(pairs)
            .into_iter()
            .chain(values.split_off(pairs))
            .map(|(_, r)| r)
            .collect();
        if !unpaired.is_empty() {
            if let Err(e) = pool.release_persistent(unpaired) {
                let regions = times.into_iter().chain(values).map(|(_, r)| r).collect();
                pool.park_persistent(series, regions)?;
                return Err(e);
            }
        }

        Ok((
            times
                .into_iter()
                .map(|(_, r)| PersistentChunk::new(r))
                .collect(),
            values
                .into_iter()
                .map(|(_, r)| PersistentChunk::new(r))
                .collect(),
        ))
    }

    fn from_chunks(
        pool: Arc<ArrayPool>,
        series: SeriesKey,
        timestamps: Vec<PersistentChunk<Timestamp>>,
        values: Vec<PersistentChunk<T>>,
    ) -> Self {
        let size: usize = timestamps.iter().map(PersistentChunk::committed).sum();
        let mut list = Self::empty(pool, series);
        list.timestamps = timestamps;
        list.values = values;
        list.size = size;

        let mut previous = Timestamp::MIN;
        for i in 0..size {
            let time = list.time_at(i);
            list.min_time = list.min_time.min(time);
            if time < previous {
                list.sorted = false;
            }
            previous = time;
        }

        list.pool.emit(BufferEvent::ListRecovered {
            series: list.series.to_string(),
            points: size,
            sorted: list.sorted,
        });
        list
    }
}

fn check_ordinals(chunks: &[(u32, PmemRegion)], role: ChunkRole) -> Result<(), String> {
    for (expected, (ordinal, _)) in chunks.iter().enumerate() {
        if *ordinal as usize != expected {
            return Err(format!("{:?} chunk ordinal {} is missing", role, expected));
        }
    }
    Ok(())
}

/// Returns how many (timestamp, value) pairs the chunks form. Chunks past that count have no
/// partner; a timestamp chunk among them must hold nothing.
fn validate_layout<T: Element>(
    times: &[(u32, PmemRegion)],
    values: &[(u32, PmemRegion)],
    array_size: usize,
) -> Result<usize, String> {
    check_ordinals(times, ChunkRole::Timestamp)?;
    check_ordinals(values, ChunkRole::Value)?;
    let pairs = times.len().min(values.len());
    if let Some((_, t)) = times[pairs..].iter().find(|(_, t)| t.committed() > 0) {
        return Err(format!(
            "timestamp region {} holds {} points but has no value chunk",
            t.id(),
            t.committed()
        ));
    }
    for (ordinal, ((_, t), (_, v))) in times.iter().zip(values).enumerate() {
        if t.data_type() != Timestamp::DATA_TYPE {
            return Err(format!("timestamp region {} holds {}", t.id(), t.data_type()));
        }
        if v.data_type() != T::DATA_TYPE {
            return Err(format!(
                "value region {} holds {}, expected {}",
                v.id(),
                v.data_type(),
                T::DATA_TYPE
            ));
        }
        if ordinal + 1 < pairs && t.committed() != array_size {
            return Err(format!(
                "timestamp region {} is not full but is not the last chunk",
                t.id()
            ));
        }
    }
    Ok(pairs)
}

impl<T: Element, M: Medium> Drop for TvList<T, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let times = std::mem::take(&mut self.timestamps);
        let values = std::mem::take(&mut self.values);
        let chunks = times.len() + values.len();
        if chunks == 0 {
            M::unclaim(&self.pool, &self.series);
            return;
        }
        let result = M::abandon_pair(&self.pool, &self.series, times, values);
        M::unclaim(&self.pool, &self.series);
        match result {
            Ok(()) if M::PERSISTENT => self.pool.emit(BufferEvent::ListParked {
                series: self.series.to_string(),
                chunks,
            }),
            Ok(()) => {}
            Err(e) => self.pool.emit(BufferEvent::ListReleaseFailed {
                series: self.series.to_string(),
                error: e.to_string(),
            }),
        }
    }
}

/// Iterator over a list's pairs in its current order.
#[derive(Debug)]
pub struct TvIter<'a, T: Element, M: Medium> {
    list: &'a TvList<T, M>,
    next: usize,
}

impl<T: Element, M: Medium> Iterator for TvIter<'_, T, M> {
    type Item = (Timestamp, T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.list.size {
            return None;
        }
        let (c, o) = self.list.locate(self.next);
        self.next += 1;
        Some((self.list.timestamps[c].get(o), self.list.values[c].get(o)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.list.size - self.next;
        (left, Some(left))
    }
}

impl<T: Element, M: Medium> ExactSizeIterator for TvIter<'_, T, M> {}

impl<T: Element, M: Medium> FusedIterator for TvIter<'_, T, M> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::ChunkOwner;
    use crate::pool::PoolConfig;
    use crate::storage::PlainChunk;
    use tempfile::TempDir;

    fn series() -> SeriesKey {
        SeriesKey::new("root.sg1", "d1", "s1")
    }

    fn plain_pool(array_size: usize) -> Arc<ArrayPool> {
        ArrayPool::new(PoolConfig {
            array_size,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    fn pmem_pool(dir: &TempDir, array_size: usize) -> Arc<ArrayPool> {
        ArrayPool::new(PoolConfig {
            array_size,
            pmem_dir: Some(dir.path().to_path_buf()),
            text_slot_bytes: 16,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    /// Deterministic scrambled timestamps with duplicates.
    fn scrambled(n: usize) -> Vec<Timestamp> {
        (0..n as i64).map(|i| (i * 7919 + 13) % 1009 - 500).collect()
    }

    /// Plain chunk that counts writes per slot.
    #[derive(Debug)]
    struct CountingChunk<E: Element> {
        inner: PlainChunk<E>,
        writes: Vec<usize>,
    }

    impl<E: Element> CountingChunk<E> {
        fn wrap(inner: PlainChunk<E>) -> Self {
            let writes = vec![0; inner.capacity()];
            CountingChunk { inner, writes }
        }
    }

    impl<E: Element> StorageSpace<E> for CountingChunk<E> {
        fn capacity(&self) -> usize {
            self.inner.capacity()
        }

        fn get(&self, index: usize) -> E {
            self.inner.get(index)
        }

        fn set(&mut self, index: usize, value: E) {
            self.writes[index] += 1;
            self.inner.set(index, value);
        }
    }

    /// Plain memory with per-slot write counts.
    #[derive(Debug)]
    struct Counting;

    impl Medium for Counting {
        type Chunk<E: Element> = CountingChunk<E>;

        const PERSISTENT: bool = false;

        fn check_pool(_pool: &ArrayPool) -> Result<(), BufferError> {
            Ok(())
        }

        fn accepts<E: Element>(_pool: &ArrayPool, _value: &E) -> bool {
            true
        }

        fn acquire_pair<E: Element>(
            pool: &ArrayPool,
            series: &SeriesKey,
            ordinal: usize,
        ) -> Result<(CountingChunk<Timestamp>, CountingChunk<E>), BufferError> {
            let (times, values) = Plain::acquire_pair::<E>(pool, series, ordinal)?;
            Ok((CountingChunk::wrap(times), CountingChunk::wrap(values)))
        }

        fn release_pair<E: Element>(
            pool: &ArrayPool,
            times: Vec<CountingChunk<Timestamp>>,
            values: Vec<CountingChunk<E>>,
        ) -> Result<(), BufferError> {
            Plain::release_pair(
                pool,
                times.into_iter().map(|c| c.inner).collect(),
                values.into_iter().map(|c| c.inner).collect(),
            )
        }

        fn abandon_pair<E: Element>(
            pool: &ArrayPool,
            series: &SeriesKey,
            times: Vec<CountingChunk<Timestamp>>,
            values: Vec<CountingChunk<E>>,
        ) -> Result<(), BufferError> {
            Plain::abandon_pair(
                pool,
                series,
                times.into_iter().map(|c| c.inner).collect(),
                values.into_iter().map(|c| c.inner).collect(),
            )
        }
    }

    fn assert_sorted_same_pairs<M: Medium>(list: &TvList<f64, M>, mut before: Vec<(Timestamp, f64)>) {
        let after: Vec<(Timestamp, f64)> = list.iter().unwrap().collect();
        assert!(after.windows(2).all(|w| w[0].0 <= w[1].0));
        let mut after_sorted = after.clone();
        let key = |p: &(Timestamp, f64)| (p.0, p.1.to_bits());
        before.sort_by_key(key);
        after_sorted.sort_by_key(key);
        assert_eq!(before, after_sorted);
    }

    #[test]
    fn test_scenario_three_points() {
        let pool = plain_pool(32);
        let mut list = DoubleTvList::new(pool, series()).unwrap();
        list.put(5, 1.0).unwrap();
        list.put(3, 2.0).unwrap();
        list.put(4, 3.0).unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list.min_time(), 3);
        assert!(!list.is_sorted());

        list.sort().unwrap();
        assert!(list.is_sorted());
        assert_eq!(list.get(0).unwrap(), (3, 2.0));
        assert_eq!(list.get(1).unwrap(), (4, 3.0));
        assert_eq!(list.get(2).unwrap(), (5, 1.0));
    }

    #[test]
    fn test_put_get_in_append_order_across_chunks() {
        let pool = plain_pool(4);
        let mut list = Int32TvList::new(pool, series()).unwrap();
        let times = scrambled(23);
        for (i, t) in times.iter().enumerate() {
            list.put(*t, i as i32).unwrap();
            assert_eq!(list.len(), i + 1);
        }
        assert_eq!(list.chunk_count(), 6);
        for (i, t) in times.iter().enumerate() {
            assert_eq!(list.get(i).unwrap(), (*t, i as i32));
        }
        assert_eq!(list.min_time(), *times.iter().min().unwrap());
    }

    #[test]
    fn test_get_out_of_range() {
        let pool = plain_pool(4);
        let mut list = FloatTvList::new(pool, series()).unwrap();
        assert!(matches!(
            list.get(0),
            Err(BufferError::IndexOutOfRange { index: 0, size: 0 })
        ));
        list.put(1, 1.0).unwrap();
        assert!(matches!(
            list.get_time(1),
            Err(BufferError::IndexOutOfRange { index: 1, size: 1 })
        ));
    }

    #[test]
    fn test_non_decreasing_puts_stay_sorted_and_sort_is_free() {
        let pool = plain_pool(8);
        let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        for t in [1, 2, 2, 3, 10, 10, 11] {
            list.put(t, t as f64).unwrap();
            assert!(list.is_sorted());
        }
        let before = pool.stats().unwrap();
        list.sort().unwrap();
        let after = pool.stats().unwrap();
        assert_eq!(before.acquire_calls, after.acquire_calls);
        assert_eq!(list.get(6).unwrap(), (11, 11.0));
    }

    #[test]
    fn test_sort_preserves_pairs_large() {
        let pool = plain_pool(16);
        let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        let times = scrambled(700);
        let before: Vec<(Timestamp, f64)> =
            times.iter().enumerate().map(|(i, t)| (*t, i as f64)).collect();
        list.put_all(&times, &before.iter().map(|p| p.1).collect::<Vec<_>>())
            .unwrap();
        assert!(!list.is_sorted());

        list.sort().unwrap();
        assert_sorted_same_pairs(&list, before);
        // Scratch went back to the pool.
        let stats = pool.stats().unwrap();
        assert_eq!(stats.plain_in_use, 2 * list.chunk_count());
    }

    #[test]
    fn test_sort_fails_on_scratch_exhaustion_and_leaves_list_untouched() {
        let pool = ArrayPool::new(PoolConfig {
            array_size: 32,
            max_plain_chunks: Some(2),
            ..PoolConfig::default()
        })
        .unwrap();
        let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        list.put(5, 1.0).unwrap();
        list.put(3, 2.0).unwrap();
        list.put(4, 3.0).unwrap();

        let err = list.sort().unwrap_err();
        assert!(matches!(err, BufferError::ResourceExhausted(_)));
        assert!(!list.is_sorted());
        assert_eq!(list.get(0).unwrap(), (5, 1.0));
        assert_eq!(list.get(1).unwrap(), (3, 2.0));
        assert_eq!(list.get(2).unwrap(), (4, 3.0));
        assert_eq!(pool.stats().unwrap().plain_in_use, 2);
    }

    #[test]
    fn test_expansion_failure_leaves_list_unchanged() {
        let pool = ArrayPool::new(PoolConfig {
            array_size: 2,
            max_plain_chunks: Some(3),
            ..PoolConfig::default()
        })
        .unwrap();
        let mut list = Int64TvList::new(Arc::clone(&pool), series()).unwrap();
        list.put(1, 10).unwrap();
        list.put(2, 20).unwrap();
        let err = list.put(3, 30).unwrap_err();
        assert!(matches!(err, BufferError::ResourceExhausted(_)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.chunk_count(), 1);
        assert_eq!(pool.stats().unwrap().plain_in_use, 2);
    }

    #[test]
    fn test_put_batch_range_and_bounds() {
        let pool = plain_pool(4);
        let mut list = BooleanTvList::new(pool, series()).unwrap();
        let times = [10, 20, 30, 40, 50];
        let values = [true, false, true, false, true];
        list.put_batch(&times, &values, 1, 4).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0).unwrap(), (20, false));
        assert_eq!(list.get(2).unwrap(), (40, false));

        let err = list.put_batch(&times, &values[..3], 0, 4).unwrap_err();
        assert!(matches!(err, BufferError::IndexOutOfRange { index: 4, size: 3 }));
        assert_eq!(list.len(), 3, "bounds are checked before anything is written");

        let err = list.put_all(&times, &values[..2]).unwrap_err();
        assert!(matches!(err, BufferError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_clone_is_independent() {
        let pool = plain_pool(4);
        let mut source = TextTvList::new(Arc::clone(&pool), series()).unwrap();
        for (t, v) in [(9, "i"), (2, "b"), (7, "g"), (1, "a"), (5, "e")] {
            source.put(t, v.to_string()).unwrap();
        }
        let mut copy = source.clone_list().unwrap();
        assert_eq!(copy.len(), source.len());
        assert_eq!(copy.min_time(), source.min_time());
        assert_eq!(copy.is_sorted(), source.is_sorted());
        for i in 0..source.len() {
            assert_eq!(copy.get(i).unwrap(), source.get(i).unwrap());
        }

        copy.put(0, "zero".to_string()).unwrap();
        copy.sort().unwrap();
        assert_eq!(source.len(), 5);
        assert_eq!(source.get(0).unwrap(), (9, "i".to_string()));
        assert_eq!(source.min_time(), 1);

        source.put(100, "z".to_string()).unwrap();
        assert_eq!(copy.len(), 6);
        assert_eq!(copy.get(0).unwrap(), (0, "zero".to_string()));
    }

    #[test]
    fn test_release_then_use_fails() {
        let pool = plain_pool(4);
        let mut list = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        for t in [3, 1, 2, 8, 6] {
            list.put(t, 0.5).unwrap();
        }
        assert_eq!(pool.stats().unwrap().plain_in_use, 4);
        list.release().unwrap();
        assert_eq!(pool.stats().unwrap().plain_in_use, 0);

        assert!(matches!(list.put(1, 1.0), Err(BufferError::InvalidState(_))));
        assert!(matches!(list.get(0), Err(BufferError::InvalidState(_))));
        assert!(matches!(list.sort(), Err(BufferError::InvalidState(_))));
        assert!(matches!(list.clone_list(), Err(BufferError::InvalidState(_))));
        assert!(matches!(list.release(), Err(BufferError::InvalidState(_))));
        assert!(list.is_released());
    }

    #[test]
    fn test_drop_returns_plain_chunks() {
        let pool = plain_pool(4);
        {
            let mut list = Int32TvList::new(Arc::clone(&pool), series()).unwrap();
            for i in 0..10 {
                list.put(i, i as i32).unwrap();
            }
            assert_eq!(pool.stats().unwrap().plain_in_use, 6);
        }
        let stats = pool.stats().unwrap();
        assert_eq!(stats.plain_in_use, 0);
        assert_eq!(stats.plain_free, 6);
    }

    #[test]
    fn test_clear_keeps_list_usable() {
        let pool = plain_pool(4);
        let mut list = FloatTvList::new(Arc::clone(&pool), series()).unwrap();
        for t in [5, 4, 3, 2, 1] {
            list.put(t, t as f32).unwrap();
        }
        list.clear().unwrap();
        assert!(list.is_empty());
        assert!(list.is_sorted());
        assert_eq!(list.min_time(), Timestamp::MAX);
        assert_eq!(pool.stats().unwrap().plain_in_use, 0);

        list.put(7, 7.0).unwrap();
        assert_eq!(list.get(0).unwrap(), (7, 7.0));
        assert_eq!(list.min_time(), 7);
    }

    #[test]
    fn test_delete_range_compacts_and_returns_chunks() {
        let pool = plain_pool(4);
        let mut list = Int64TvList::new(Arc::clone(&pool), series()).unwrap();
        for t in [10, 1, 20, 2, 30, 3, 40, 4, 50] {
            list.put(t, t * 100).unwrap();
        }
        assert_eq!(list.chunk_count(), 3);

        let removed = list.delete_range(10, 40).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(list.len(), 5);
        assert_eq!(list.chunk_count(), 2);
        let pairs: Vec<_> = list.iter().unwrap().collect();
        assert_eq!(pairs, vec![(1, 100), (2, 200), (3, 300), (4, 400), (50, 5000)]);
        assert_eq!(list.min_time(), 1);
        assert_eq!(pool.stats().unwrap().plain_in_use, 4);

        assert_eq!(list.delete_range(100, 200).unwrap(), 0);
        assert_eq!(list.delete_range(Timestamp::MIN, Timestamp::MAX).unwrap(), 5);
        assert!(list.is_empty());
        assert_eq!(list.chunk_count(), 0);
        assert_eq!(list.min_time(), Timestamp::MAX);
    }

    #[test]
    fn test_delete_range_updates_min_time() {
        let pool = plain_pool(4);
        let mut list = DoubleTvList::new(pool, series()).unwrap();
        for t in [5, 1, 9] {
            list.put(t, 0.0).unwrap();
        }
        list.delete_range(0, 1).unwrap();
        assert_eq!(list.min_time(), 5);
    }

    #[test]
    fn test_last_and_max_time() {
        let pool = plain_pool(4);
        let mut list = DoubleTvList::new(pool, series()).unwrap();
        assert_eq!(list.last_time().unwrap(), None);
        assert_eq!(list.max_time().unwrap(), None);
        for t in [5, 9, 2] {
            list.put(t, 0.0).unwrap();
        }
        assert_eq!(list.last_time().unwrap(), Some(2));
        assert_eq!(list.max_time().unwrap(), Some(9));
    }

    #[test]
    fn test_sorted_iter_and_pairs() {
        let pool = plain_pool(4);
        let mut list = Int32TvList::new(pool, series()).unwrap();
        for (t, v) in [(3, 30), (1, 10), (2, 20)] {
            list.put(t, v).unwrap();
        }
        let pairs: Vec<_> = list.sorted_iter().unwrap().collect();
        assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);
        assert_eq!(list.iter().unwrap().len(), 3);
        assert_eq!(
            list.get_pair(2).unwrap(),
            TimeValuePair {
                timestamp: 3,
                value: crate::types::TsValue::Int32(30)
            }
        );
    }

    #[test]
    fn test_equal_timestamps_keep_their_values() {
        let pool = plain_pool(4);
        let mut list = Int32TvList::new(pool, series()).unwrap();
        for (t, v) in [(2, 1), (1, 2), (2, 3), (1, 4), (2, 5)] {
            list.put(t, v).unwrap();
        }
        list.sort().unwrap();
        let mut ones: Vec<i32> = list.iter().unwrap().filter(|p| p.0 == 1).map(|p| p.1).collect();
        let mut twos: Vec<i32> = list.iter().unwrap().filter(|p| p.0 == 2).map(|p| p.1).collect();
        ones.sort_unstable();
        twos.sort_unstable();
        // Order among equal timestamps is unspecified; only membership is checked.
        assert_eq!(ones, vec![2, 4]);
        assert_eq!(twos, vec![1, 3, 5]);
    }

    #[test]
    fn test_persistent_list_needs_heap() {
        let pool = plain_pool(4);
        let err = NvmDoubleTvList::new(pool, series()).unwrap_err();
        assert!(matches!(err, BufferError::ConfigError(_)));
    }

    #[test]
    fn test_persistent_scenario_and_clone_is_plain() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        let mut list = NvmFloatTvList::new(Arc::clone(&pool), series()).unwrap();
        list.put(5, 1.0).unwrap();
        list.put(3, 2.0).unwrap();
        list.put(4, 3.0).unwrap();
        assert!(list.is_persistent());
        assert_eq!(pool.stats().unwrap().persistent_in_use, 2);

        let copy = list.clone_list().unwrap();
        assert!(!copy.is_persistent());

        list.sort().unwrap();
        assert_eq!(list.get(0).unwrap(), (3, 2.0));
        assert_eq!(list.get(2).unwrap(), (5, 1.0));
        // Scratch for a persistent list is plain memory.
        assert_eq!(pool.stats().unwrap().persistent_in_use, 2);
        assert_eq!(copy.get(0).unwrap(), (5, 1.0));
    }

    #[test]
    fn test_persistent_sort_fails_without_plain_scratch() {
        let dir = TempDir::new().unwrap();
        let pool = ArrayPool::new(PoolConfig {
            array_size: 4,
            max_plain_chunks: Some(0),
            pmem_dir: Some(dir.path().to_path_buf()),
            ..PoolConfig::default()
        })
        .unwrap();
        let mut list = NvmDoubleTvList::new(pool, series()).unwrap();
        list.put(2, 0.2).unwrap();
        list.put(1, 0.1).unwrap();
        assert!(matches!(list.sort(), Err(BufferError::ResourceExhausted(_))));
        assert_eq!(list.get(0).unwrap(), (2, 0.2));
        assert_eq!(list.get(1).unwrap(), (1, 0.1));
    }

    #[test]
    fn test_persistent_text_too_long_is_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        let mut list = NvmTextTvList::new(pool, series()).unwrap();
        list.put(1, "fits in 12b".to_string()).unwrap();
        let err = list
            .put(2, "this one is far too long".to_string())
            .unwrap_err();
        assert!(matches!(err, BufferError::ResourceExhausted(_)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_dropped_persistent_list_is_recoverable() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        {
            let mut list = NvmInt64TvList::new(Arc::clone(&pool), series()).unwrap();
            for t in [9, 3, 7, 1, 5, 11] {
                list.put(t, t * 2).unwrap();
            }
        }
        assert_eq!(pool.recovered_series().unwrap(), vec![(series(), DataType::Int64)]);

        let mut list = NvmInt64TvList::recover(Arc::clone(&pool), series()).unwrap();
        assert_eq!(list.len(), 6);
        assert_eq!(list.min_time(), 1);
        assert!(!list.is_sorted());
        assert_eq!(list.get(5).unwrap(), (11, 22));

        list.release().unwrap();
        assert!(pool.recovered_series().unwrap().is_empty());
        let stats = pool.stats().unwrap();
        assert_eq!(stats.persistent_in_use, 0);
        assert_eq!(stats.persistent_free, 4);
    }

    #[test]
    fn test_recover_with_wrong_type_is_corruption() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        {
            let mut list = NvmDoubleTvList::new(Arc::clone(&pool), series()).unwrap();
            list.put(1, 1.0).unwrap();
        }
        let err = NvmInt32TvList::recover(Arc::clone(&pool), series()).unwrap_err();
        assert!(matches!(err, BufferError::Corruption { .. }));

        // The regions stay parked for a correctly typed attempt.
        let list = NvmDoubleTvList::recover(pool, series()).unwrap();
        assert_eq!(list.get(0).unwrap(), (1, 1.0));
    }

    #[test]
    fn test_persistent_delete_range_truncates_committed() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        {
            let mut list = NvmInt32TvList::new(Arc::clone(&pool), series()).unwrap();
            for t in 0..10 {
                list.put(t, t as i32).unwrap();
            }
            assert_eq!(list.delete_range(3, 8).unwrap(), 6);
            assert_eq!(list.len(), 4);
        }
        let list = NvmInt32TvList::recover(pool, series()).unwrap();
        let pairs: Vec<_> = list.iter().unwrap().collect();
        assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2), (9, 9)]);
        assert!(list.is_sorted());
    }

    #[test]
    fn test_recover_unknown_series_is_empty() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        let list = NvmBooleanTvList::recover(pool, series()).unwrap();
        assert!(list.is_empty());
        assert!(list.is_sorted());
    }

    #[test]
    fn test_sort_writes_each_primary_slot_once() {
        let pool = plain_pool(8);
        let mut list = TvList::<f64, Counting>::new(Arc::clone(&pool), series()).unwrap();
        for (i, t) in scrambled(45).into_iter().enumerate() {
            list.put(t, i as f64).unwrap();
        }
        for chunk in &mut list.timestamps {
            chunk.writes.fill(0);
        }
        for chunk in &mut list.values {
            chunk.writes.fill(0);
        }

        list.sort().unwrap();
        for i in 0..list.len() {
            let (c, o) = list.locate(i);
            assert_eq!(list.timestamps[c].writes[o], 1, "timestamp slot {}", i);
            assert_eq!(list.values[c].writes[o], 1, "value slot {}", i);
        }
        let (c, o) = list.locate(45);
        assert!(list.timestamps[c].writes[o..].iter().all(|w| *w == 0));
        assert!(list.values[c].writes[o..].iter().all(|w| *w == 0));

        // Already sorted: nothing is written.
        list.sort().unwrap();
        let total: usize = list.timestamps.iter().flat_map(|c| &c.writes).sum();
        assert_eq!(total, 45);
    }

    #[test]
    fn test_new_refuses_series_with_parked_chunks() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        {
            let mut list = NvmInt64TvList::new(Arc::clone(&pool), series()).unwrap();
            for t in 0..5 {
                list.put(t, t).unwrap();
            }
        }

        let err = NvmInt64TvList::new(Arc::clone(&pool), series()).unwrap_err();
        assert!(matches!(err, BufferError::InvalidState(_)));
        assert_eq!(pool.stats().unwrap().persistent_in_use, 0);

        let list = NvmInt64TvList::recover(Arc::clone(&pool), series()).unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(list.get(4).unwrap(), (4, 4));
    }

    #[test]
    fn test_series_is_held_by_one_live_list() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        let mut first = NvmDoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        first.put(1, 1.0).unwrap();

        assert!(matches!(
            NvmDoubleTvList::new(Arc::clone(&pool), series()),
            Err(BufferError::InvalidState(_))
        ));
        assert!(matches!(
            NvmDoubleTvList::recover(Arc::clone(&pool), series()),
            Err(BufferError::InvalidState(_))
        ));
        // Plain lists never hold a series.
        let _plain = DoubleTvList::new(Arc::clone(&pool), series()).unwrap();

        first.release().unwrap();
        let mut second = NvmDoubleTvList::new(Arc::clone(&pool), series()).unwrap();
        second.put(2, 2.0).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_empty_dropped_list_frees_its_series() {
        let dir = TempDir::new().unwrap();
        let pool = pmem_pool(&dir, 4);
        drop(NvmFloatTvList::new(Arc::clone(&pool), series()).unwrap());
        let list = NvmFloatTvList::new(Arc::clone(&pool), series()).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_recover_releases_timestamp_chunk_without_partner() {
        let dir = TempDir::new().unwrap();
        {
            let pool = pmem_pool(&dir, 4);
            let mut list = NvmInt64TvList::new(Arc::clone(&pool), series()).unwrap();
            for t in 0..4 {
                list.put(t, t * 10).unwrap();
            }
            // A timestamp chunk bound on its own, as a heap that bound roles separately could
            // leave behind after a crash.
            let stray = pool
                .acquire_bound(&[(
                    DataType::Int64,
                    ChunkOwner::new(&series(), ChunkRole::Timestamp, 1),
                )])
                .unwrap();
            std::mem::forget(stray);
            std::mem::forget(list);
        }

        let pool = pmem_pool(&dir, 4);
        let mut list = NvmInt64TvList::recover(Arc::clone(&pool), series()).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list.chunk_count(), 1);
        assert_eq!(list.get(3).unwrap(), (3, 30));
        let stats = pool.stats().unwrap();
        assert_eq!(stats.persistent_in_use, 2);
        assert_eq!(stats.persistent_free, 1);

        list.put(4, 40).unwrap();
        assert_eq!(list.chunk_count(), 2);
        assert_eq!(pool.stats().unwrap().persistent_allocated, 1);
    }

    #[test]
    fn test_recover_rejects_unpaired_timestamp_chunk_with_points() {
        let dir = TempDir::new().unwrap();
        {
            let pool = pmem_pool(&dir, 4);
            let mut list = NvmInt32TvList::new(Arc::clone(&pool), series()).unwrap();
            list.put(1, 1).unwrap();
            let mut stray = pool
                .acquire_bound(&[(
                    DataType::Int64,
                    ChunkOwner::new(&series(), ChunkRole::Timestamp, 1),
                )])
                .unwrap();
            stray[0].set_committed(1);
            std::mem::forget(stray);
            std::mem::forget(list);
        }

        let pool = pmem_pool(&dir, 4);
        let err = NvmInt32TvList::recover(Arc::clone(&pool), series()).unwrap_err();
        assert!(matches!(err, BufferError::Corruption { .. }));
        // Everything stays parked, and the series is free for another attempt.
        assert_eq!(pool.recovered_series().unwrap(), vec![(series(), DataType::Int32)]);
        assert!(matches!(
            NvmInt32TvList::recover(pool, series()),
            Err(BufferError::Corruption { .. })
        ));
    }
}
