//! Out-of-place sort engine.
//!
//! The algorithm only talks to its data through [`SortHooks`], so one routine serves every element
//! kind. Lists stage their elements into a pooled [`ScratchSpace`], sort there, and copy the result
//! back in a single pass.

use crate::element::Element;
use crate::error::BufferError;
use crate::pool::ArrayPool;
use crate::storage::PlainChunk;
use crate::types::Timestamp;

/// Ranges at most this long are sorted by binary insertion.
pub const INSERTION_SORT_THRESHOLD: usize = 32;

/// Capabilities the sort routine needs from the buffers it reorders.
///
/// Indices address the working buffer unless the method name says `stashed`; the merge buffer is
/// addressed with the same index space.
pub trait SortHooks {
    type Value;

    fn time_at(&self, index: usize) -> Timestamp;

    fn value_at(&self, index: usize) -> Self::Value;

    fn write(&mut self, index: usize, time: Timestamp, value: Self::Value);

    /// Copies element `src` over element `dest` in the working buffer.
    fn assign(&mut self, dest: usize, src: usize);

    /// Copies working element `src` to merge-buffer position `dest`.
    fn stash(&mut self, src: usize, dest: usize);

    fn stashed_time_at(&self, index: usize) -> Timestamp;

    /// Copies merge-buffer element `src` to working position `dest`.
    fn unstash(&mut self, src: usize, dest: usize);
}

/// Sorts `[lo, hi)` by timestamp. Equal timestamps end up in no guaranteed order.
pub fn sort_range<H: SortHooks>(hooks: &mut H, lo: usize, hi: usize) {
    if hi <= lo + 1 {
        return;
    }
    if hi - lo <= INSERTION_SORT_THRESHOLD {
        binary_insertion_sort(hooks, lo, hi);
        return;
    }
    let mid = lo + (hi - lo) / 2;
    sort_range(hooks, lo, mid);
    sort_range(hooks, mid, hi);
    // Halves already in order: nothing to merge.
    if hooks.time_at(mid - 1) <= hooks.time_at(mid) {
        return;
    }
    merge(hooks, lo, mid, hi);
}

fn binary_insertion_sort<H: SortHooks>(hooks: &mut H, lo: usize, hi: usize) {
    for i in lo + 1..hi {
        let time = hooks.time_at(i);
        if hooks.time_at(i - 1) <= time {
            continue;
        }
        let (mut left, mut right) = (lo, i);
        while left < right {
            let m = left + (right - left) / 2;
            if hooks.time_at(m) <= time {
                left = m + 1;
            } else {
                right = m;
            }
        }
        let value = hooks.value_at(i);
        let mut j = i;
        while j > left {
            hooks.assign(j, j - 1);
            j -= 1;
        }
        hooks.write(left, time, value);
    }
}

fn merge<H: SortHooks>(hooks: &mut H, lo: usize, mid: usize, hi: usize) {
    for i in lo..mid {
        hooks.stash(i, i);
    }
    let (mut l, mut r, mut out) = (lo, mid, lo);
    // out < r holds while the left run is not exhausted, so no unread right element is overwritten.
    while l < mid && r < hi {
        if hooks.stashed_time_at(l) <= hooks.time_at(r) {
            hooks.unstash(l, out);
            l += 1;
        } else {
            hooks.assign(out, r);
            r += 1;
        }
        out += 1;
    }
    while l < mid {
        hooks.unstash(l, out);
        l += 1;
        out += 1;
    }
}

/// Plain chunks borrowed from the pool for the duration of one sort: a working copy of the
/// timestamps and values, and a merge buffer of the same size.
///
/// Returned to the pool on drop, so a sort that fails or unwinds never leaks scratch chunks.
#[derive(Debug)]
pub struct ScratchSpace<'a, T: Element> {
    pool: &'a ArrayPool,
    array_size: usize,
    times: Vec<PlainChunk<Timestamp>>,
    values: Vec<PlainChunk<T>>,
    stashed_times: Vec<PlainChunk<Timestamp>>,
    stashed_values: Vec<PlainChunk<T>>,
}

impl<'a, T: Element> ScratchSpace<'a, T> {
    /// Acquires enough scratch for `len` elements. Nothing stays acquired on failure.
    pub fn stage(pool: &'a ArrayPool, len: usize) -> Result<Self, BufferError> {
        let array_size = pool.array_size();
        let chunk_count = len.div_ceil(array_size);

        let mut times = pool.acquire_plain::<Timestamp>(chunk_count * 2)?;
        let mut values = match pool.acquire_plain::<T>(chunk_count * 2) {
            Ok(v) => v,
            Err(e) => {
                // Already failing; a release error would only mask the original.
                let _ = pool.release_plain(times);
                return Err(e);
            }
        };
        let stashed_times = times.split_off(chunk_count);
        let stashed_values = values.split_off(chunk_count);

        Ok(ScratchSpace {
            pool,
            array_size,
            times,
            values,
            stashed_times,
            stashed_values,
        })
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.array_size, index % self.array_size)
    }

    /// The working copy, chunk by chunk.
    pub fn working(&self) -> (&[PlainChunk<Timestamp>], &[PlainChunk<T>]) {
        (&self.times, &self.values)
    }
}

impl<T: Element> SortHooks for ScratchSpace<'_, T> {
    type Value = T;

    #[inline]
    fn time_at(&self, index: usize) -> Timestamp {
        let (c, o) = self.locate(index);
        self.times[c].as_slice()[o]
    }

    #[inline]
    fn value_at(&self, index: usize) -> T {
        let (c, o) = self.locate(index);
        self.values[c].as_slice()[o].clone()
    }

    #[inline]
    fn write(&mut self, index: usize, time: Timestamp, value: T) {
        let (c, o) = self.locate(index);
        self.times[c].as_mut_slice()[o] = time;
        self.values[c].as_mut_slice()[o] = value;
    }

    #[inline]
    fn assign(&mut self, dest: usize, src: usize) {
        let (sc, so) = self.locate(src);
        let time = self.times[sc].as_slice()[so];
        let value = self.values[sc].as_slice()[so].clone();
        self.write(dest, time, value);
    }

    #[inline]
    fn stash(&mut self, src: usize, dest: usize) {
        let (sc, so) = self.locate(src);
        let (dc, d) = self.locate(dest);
        self.stashed_times[dc].as_mut_slice()[d] = self.times[sc].as_slice()[so];
        self.stashed_values[dc].as_mut_slice()[d] = self.values[sc].as_slice()[so].clone();
    }

    #[inline]
    fn stashed_time_at(&self, index: usize) -> Timestamp {
        let (c, o) = self.locate(index);
        self.stashed_times[c].as_slice()[o]
    }

    #[inline]
    fn unstash(&mut self, src: usize, dest: usize) {
        let (sc, so) = self.locate(src);
        let time = self.stashed_times[sc].as_slice()[so];
        let value = self.stashed_values[sc].as_slice()[so].clone();
        self.write(dest, time, value);
    }
}

impl<T: Element> Drop for ScratchSpace<'_, T> {
    fn drop(&mut self) {
        let mut times = std::mem::take(&mut self.times);
        times.append(&mut self.stashed_times);
        let mut values = std::mem::take(&mut self.values);
        values.append(&mut self.stashed_values);
        // Drop cannot report; a poisoned pool lock leaves the chunks to the allocator.
        let _ = self.pool.release_plain(times);
        let _ = self.pool.release_plain(values);
    }
}
