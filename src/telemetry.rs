use crate::types::DataType;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; it never prints. Callers can provide an implementation that forwards
/// these events to `tracing`, `log`, metrics, or custom sinks.
pub trait BufferEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: BufferEvent);
}

/// Structured events emitted by the pool and by lists.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    HeapOpened {
        dir: PathBuf,
        epoch: u64,
        regions: usize,
        parked_series: usize,
    },
    RegionsAllocated { data_type: DataType, created: usize, reused: usize },
    RegistryWriteFailed { error: String },

    PoolExhausted {
        data_type: DataType,
        persistent: bool,
        requested: usize,
        limit: usize,
    },

    ListSorted { series: String, points: usize, duration: Duration },
    ListCleared { series: String, chunks: usize },
    ListReleased { series: String, chunks: usize },
    ListParked { series: String, chunks: usize },
    ListReleaseFailed { series: String, error: String },
    ListRecovered { series: String, points: usize, sorted: bool },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl BufferEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: BufferEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn BufferEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is a no-op until a recorder is installed. With the `prometheus` feature, callers can
/// install an in-process recorder and render the exposition text themselves.
pub mod buffer_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
    #[cfg(feature = "prometheus")]
    use std::sync::atomic::{AtomicBool, Ordering};
    #[cfg(feature = "prometheus")]
    use std::sync::Mutex;
    #[cfg(feature = "prometheus")]
    use std::thread::JoinHandle;

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const POINTS_APPENDED: &str = "tvbuf_points_appended";
    pub const CHUNKS_ACQUIRED: &str = "tvbuf_chunks_acquired";
    pub const CHUNKS_RELEASED: &str = "tvbuf_chunks_released";
    pub const CHUNKS_ALLOCATED: &str = "tvbuf_chunks_allocated";
    pub const POOL_EXHAUSTED: &str = "tvbuf_pool_exhausted";

    pub const SORT_DURATION_SECONDS: &str = "tvbuf_sort_duration_seconds";
    pub const SORT_POINTS: &str = "tvbuf_sort_points";

    pub const PMEM_MAPPED_BYTES: &str = "tvbuf_pmem_mapped_bytes";

    #[inline]
    fn medium(persistent: bool) -> &'static str {
        if persistent {
            "persistent"
        } else {
            "plain"
        }
    }

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("tvbuf-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_points_appended(points: u64) {
        if points > 0 {
            ::metrics::counter!(POINTS_APPENDED).increment(points);
        }
    }

    #[inline]
    pub fn record_acquire(persistent: bool, chunks: u64, allocated: u64) {
        ::metrics::counter!(CHUNKS_ACQUIRED, "medium" => medium(persistent)).increment(chunks);
        if allocated > 0 {
            ::metrics::counter!(CHUNKS_ALLOCATED, "medium" => medium(persistent))
                .increment(allocated);
        }
    }

    #[inline]
    pub fn record_release(persistent: bool, chunks: u64) {
        if chunks > 0 {
            ::metrics::counter!(CHUNKS_RELEASED, "medium" => medium(persistent)).increment(chunks);
        }
    }

    #[inline]
    pub fn record_exhausted(persistent: bool) {
        ::metrics::counter!(POOL_EXHAUSTED, "medium" => medium(persistent)).increment(1);
    }

    #[inline]
    pub fn record_sort(duration: Duration, points: u64) {
        ::metrics::histogram!(SORT_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::counter!(SORT_POINTS).increment(points);
    }

    #[inline]
    pub fn record_pmem_mapped(bytes: u64) {
        ::metrics::gauge!(PMEM_MAPPED_BYTES).set(bytes as f64);
    }

    #[cfg_attr(not(feature = "prometheus"), allow(dead_code))]
    fn describe_all() {
        describe_counter!(
            POINTS_APPENDED,
            Unit::Count,
            "Total number of points appended to time-value lists."
        );
        describe_counter!(
            CHUNKS_ACQUIRED,
            Unit::Count,
            "Chunks handed out by the array pool, by medium."
        );
        describe_counter!(
            CHUNKS_RELEASED,
            Unit::Count,
            "Chunks returned to the array pool, by medium."
        );
        describe_counter!(
            CHUNKS_ALLOCATED,
            Unit::Count,
            "Chunks the pool had to allocate because no idle chunk was available."
        );
        describe_counter!(
            POOL_EXHAUSTED,
            Unit::Count,
            "Acquire calls rejected because a chunk limit would be exceeded."
        );

        describe_histogram!(
            SORT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to stage, sort and write back one list."
        );
        describe_counter!(SORT_POINTS, Unit::Count, "Points reordered by list sorts.");

        describe_gauge!(
            PMEM_MAPPED_BYTES,
            Unit::Bytes,
            "Bytes of persistent regions currently mapped by the pool."
        );
    }
}
