//! The array pool: the one structure shared between lists. It caches idle chunks per element
//! kind so lists growing and shrinking under pressure recycle storage instead of reallocating.

use crate::element::{Element, PooledArray};
use crate::error::BufferError;
use crate::pmem::{ChunkOwner, PersistentHeap, PmemRegion};
use crate::storage::PlainChunk;
use crate::telemetry::{buffer_metrics, noop_event_listener, BufferEvent, BufferEventListener};
use crate::types::{DataType, SeriesKey};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Default number of elements per chunk.
pub const DEFAULT_ARRAY_SIZE: usize = 32;
/// Default persistent slot width for text values (length prefix included).
pub const DEFAULT_TEXT_SLOT_BYTES: usize = 256;

/// Configuration options for the ArrayPool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Elements per chunk (`C`). Every chunk the pool issues has exactly this capacity.
    pub array_size: usize,
    /// Upper bound on plain chunks handed out at once (primary and scratch). `None` = unbounded.
    pub max_plain_chunks: Option<usize>,
    /// Upper bound on persistent regions handed out at once. `None` = unbounded.
    pub max_persistent_chunks: Option<usize>,
    /// Directory of the persistent heap. Persistent lists are only available when set.
    pub pmem_dir: Option<PathBuf>,
    /// Slot width of text values in persistent regions, including the 4-byte length prefix.
    pub text_slot_bytes: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn BufferEventListener>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            array_size: DEFAULT_ARRAY_SIZE,
            max_plain_chunks: None,
            max_persistent_chunks: None,
            pmem_dir: None,
            text_slot_bytes: DEFAULT_TEXT_SLOT_BYTES,
            event_listener: noop_event_listener(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.array_size == 0 {
            return Err(BufferError::ConfigError(
                "array_size must be greater than zero".to_string(),
            ));
        }
        if self.array_size > u32::MAX as usize {
            return Err(BufferError::ConfigError(format!(
                "array_size {} does not fit a region header",
                self.array_size
            )));
        }
        if self.text_slot_bytes < 5 {
            return Err(BufferError::ConfigError(format!(
                "text_slot_bytes must be at least 5, got {}",
                self.text_slot_bytes
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquire_calls: u64,
    pub release_calls: u64,
    pub plain_allocated: u64,
    pub persistent_allocated: u64,
    pub reused: u64,
    pub plain_in_use: usize,
    pub persistent_in_use: usize,
    pub plain_free: usize,
    pub persistent_free: usize,
}

#[derive(Debug, Default)]
struct Counters {
    acquire_calls: u64,
    release_calls: u64,
    plain_allocated: u64,
    persistent_allocated: u64,
    reused: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    free: HashMap<DataType, Vec<PooledArray>>,
    plain_in_use: usize,
    heap: Option<PersistentHeap>,
    counters: Counters,
}

/// Thread-safe cache of fixed-capacity chunks, shared by every list it issued chunks to.
///
/// Acquire and release serialize on one mutex; data inside an issued chunk is the owning list's
/// business. The pool never waits for chunks: a request over a configured limit fails at once.
#[derive(Debug)]
pub struct ArrayPool {
    config: PoolConfig,
    persistent: bool,
    state: Mutex<PoolState>,
}

impl ArrayPool {
    /// Creates a pool, opening the persistent heap when `pmem_dir` is set.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, BufferError> {
        config.validate()?;

        let heap = match &config.pmem_dir {
            Some(dir) => {
                let (heap, report) =
                    PersistentHeap::open(dir, config.array_size, config.text_slot_bytes)?;
                buffer_metrics::record_pmem_mapped(heap.mapped_bytes());
                config.event_listener.on_event(BufferEvent::HeapOpened {
                    dir: dir.clone(),
                    epoch: report.epoch,
                    regions: report.regions,
                    parked_series: report.parked_series,
                });
                Some(heap)
            }
            None => None,
        };

        Ok(Arc::new(ArrayPool {
            persistent: heap.is_some(),
            config,
            state: Mutex::new(PoolState {
                heap,
                ..PoolState::default()
            }),
        }))
    }

    /// A plain-memory pool with default settings.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(ArrayPool {
            config: PoolConfig::default(),
            persistent: false,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn array_size(&self) -> usize {
        self.config.array_size
    }

    pub fn has_persistent_heap(&self) -> bool {
        self.persistent
    }

    pub fn stats(&self) -> Result<PoolStats, BufferError> {
        let state = self.state.lock()?;
        let c = &state.counters;
        Ok(PoolStats {
            acquire_calls: c.acquire_calls,
            release_calls: c.release_calls,
            plain_allocated: c.plain_allocated,
            persistent_allocated: c.persistent_allocated,
            reused: c.reused,
            plain_in_use: state.plain_in_use,
            persistent_in_use: state.heap.as_ref().map_or(0, PersistentHeap::in_use),
            plain_free: state.free.values().map(Vec::len).sum(),
            persistent_free: state.heap.as_ref().map_or(0, PersistentHeap::free_count),
        })
    }

    /// Series whose persistent chunks survived from an earlier run (or a dropped list) and can be
    /// rebuilt with `TvList::recover`, with the element kind of their values.
    pub fn recovered_series(&self) -> Result<Vec<(SeriesKey, DataType)>, BufferError> {
        let state = self.state.lock()?;
        Ok(state
            .heap
            .as_ref()
            .map(PersistentHeap::parked_series)
            .unwrap_or_default())
    }

    pub(crate) fn emit(&self, event: BufferEvent) {
        self.config.event_listener.on_event(event);
    }

    fn exhausted(
        &self,
        data_type: DataType,
        persistent: bool,
        requested: usize,
        in_use: usize,
        limit: usize,
    ) -> BufferError {
        buffer_metrics::record_exhausted(persistent);
        self.emit(BufferEvent::PoolExhausted {
            data_type,
            persistent,
            requested,
            limit,
        });
        BufferError::ResourceExhausted(format!(
            "{} chunk limit {} reached: {} in use, {} more {} chunks requested",
            if persistent { "persistent" } else { "plain" },
            limit,
            in_use,
            requested,
            data_type
        ))
    }

    /// Hands out `count` plain chunks of `E`, reusing idle ones first. All or nothing.
    pub(crate) fn acquire_plain<E: Element>(
        &self,
        count: usize,
    ) -> Result<Vec<PlainChunk<E>>, BufferError> {
        let mut guard = self.state.lock()?;
        let PoolState {
            free,
            plain_in_use,
            counters,
            ..
        } = &mut *guard;
        counters.acquire_calls += 1;

        if let Some(limit) = self.config.max_plain_chunks {
            if *plain_in_use + count > limit {
                let in_use = *plain_in_use;
                drop(guard);
                return Err(self.exhausted(E::DATA_TYPE, false, count, in_use, limit));
            }
        }

        let idle = free.entry(E::DATA_TYPE).or_default();
        let mut chunks = Vec::with_capacity(count);
        let mut allocated = 0u64;
        while chunks.len() < count {
            match idle.pop() {
                Some(array) => match E::from_pooled(array) {
                    Ok(data) => chunks.push(PlainChunk::new(data)),
                    Err(other) => {
                        let kind = other.data_type();
                        idle.push(other);
                        // Chunks popped so far go back untouched.
                        idle.extend(
                            chunks
                                .into_iter()
                                .map(|chunk| E::into_pooled(chunk.into_inner())),
                        );
                        return Err(BufferError::Internal(format!(
                            "{} array found on the {} free list",
                            kind,
                            E::DATA_TYPE
                        )));
                    }
                },
                None => {
                    chunks.push(PlainChunk::new(
                        vec![E::default(); self.config.array_size].into_boxed_slice(),
                    ));
                    allocated += 1;
                }
            }
        }

        *plain_in_use += count;
        counters.plain_allocated += allocated;
        counters.reused += count as u64 - allocated;
        drop(guard);

        buffer_metrics::record_acquire(false, count as u64, allocated);
        Ok(chunks)
    }

    pub(crate) fn release_plain<E: Element>(
        &self,
        chunks: Vec<PlainChunk<E>>,
    ) -> Result<(), BufferError> {
        let count = chunks.len();
        let arrays: Vec<PooledArray> = chunks
            .into_iter()
            .map(|chunk| {
                let mut data = chunk.into_inner();
                E::scrub(&mut data);
                E::into_pooled(data)
            })
            .collect();

        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        state.counters.release_calls += 1;
        state.plain_in_use = state.plain_in_use.saturating_sub(count);
        state.free.entry(E::DATA_TYPE).or_default().extend(arrays);
        drop(guard);

        buffer_metrics::record_release(false, count as u64);
        Ok(())
    }

    /// Hands out one persistent region per request, bound to the request's owner. The bindings
    /// reach the registry in one write. All or nothing.
    pub(crate) fn acquire_bound(
        &self,
        requests: &[(DataType, ChunkOwner)],
    ) -> Result<Vec<PmemRegion>, BufferError> {
        let count = requests.len();
        let mut guard = self.state.lock()?;
        let PoolState { heap, counters, .. } = &mut *guard;
        counters.acquire_calls += 1;
        let heap = heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;

        if let Some(limit) = self.config.max_persistent_chunks {
            if heap.in_use() + count > limit {
                let in_use = heap.in_use();
                let data_type = requests.first().map_or(DataType::Int64, |(dt, _)| *dt);
                drop(guard);
                return Err(self.exhausted(data_type, true, count, in_use, limit));
            }
        }

        let taken = match heap.allocate_bound(requests) {
            Ok(r) => r,
            Err(e) => {
                drop(guard);
                self.emit(BufferEvent::RegistryWriteFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        let created = taken.iter().filter(|(_, created)| *created).count();
        counters.persistent_allocated += created as u64;
        counters.reused += (count - created) as u64;
        let mapped = heap.mapped_bytes();
        drop(guard);

        buffer_metrics::record_acquire(true, count as u64, created as u64);
        if created > 0 {
            buffer_metrics::record_pmem_mapped(mapped);
        }

        // One event per element kind, in request order.
        let mut per_kind: Vec<(DataType, usize, usize)> = Vec::new();
        for (region, was_created) in &taken {
            let dt = region.data_type();
            let idx = match per_kind.iter().position(|(k, _, _)| *k == dt) {
                Some(idx) => idx,
                None => {
                    per_kind.push((dt, 0, 0));
                    per_kind.len() - 1
                }
            };
            if *was_created {
                per_kind[idx].1 += 1;
            } else {
                per_kind[idx].2 += 1;
            }
        }
        for (data_type, created, reused) in per_kind {
            self.emit(BufferEvent::RegionsAllocated {
                data_type,
                created,
                reused,
            });
        }
        Ok(taken.into_iter().map(|(region, _)| region).collect())
    }

    pub(crate) fn release_persistent(&self, regions: Vec<PmemRegion>) -> Result<(), BufferError> {
        let count = regions.len();
        let mut guard = self.state.lock()?;
        let PoolState { heap, counters, .. } = &mut *guard;
        counters.release_calls += 1;
        let heap = heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;
        let result = heap.release(regions);
        drop(guard);

        buffer_metrics::record_release(true, count as u64);
        if let Err(e) = &result {
            self.emit(BufferEvent::RegistryWriteFailed {
                error: e.to_string(),
            });
        }
        result
    }

    pub(crate) fn park_persistent(
        &self,
        series: &SeriesKey,
        regions: Vec<PmemRegion>,
    ) -> Result<(), BufferError> {
        let mut guard = self.state.lock()?;
        let heap = guard.heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;
        heap.park(series, regions);
        Ok(())
    }

    pub(crate) fn take_parked(
        &self,
        series: &SeriesKey,
    ) -> Result<Vec<(ChunkOwner, PmemRegion)>, BufferError> {
        let mut guard = self.state.lock()?;
        let heap = guard.heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;
        heap.take_parked(series)
    }

    /// Reserves `series` for a new persistent list. See `PersistentHeap::claim`.
    pub(crate) fn claim_series(&self, series: &SeriesKey) -> Result<(), BufferError> {
        let mut guard = self.state.lock()?;
        let heap = guard.heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;
        heap.claim(series)
    }

    /// Reserves `series` for a list rebuilt from its parked chunks.
    pub(crate) fn claim_series_for_recovery(&self, series: &SeriesKey) -> Result<(), BufferError> {
        let mut guard = self.state.lock()?;
        let heap = guard.heap.as_mut().ok_or_else(|| {
            BufferError::ConfigError("pool has no persistent heap".to_string())
        })?;
        heap.claim_for_recovery(series)
    }

    pub(crate) fn unclaim_series(&self, series: &SeriesKey) -> Result<(), BufferError> {
        let mut guard = self.state.lock()?;
        if let Some(heap) = guard.heap.as_mut() {
            heap.unclaim(series);
        }
        Ok(())
    }
}
