use std::sync::Arc;

use crate::types::{Shard, Timestamp, Volume};

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not
/// acceptable for production. Instead, callers can provide an implementation
/// that forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait EventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone)]
pub enum DbEvent {
    /// Invariant telemetry sink: these must not occur under correct
    /// operation and indicate a bug in this crate.
    InvariantViolated { detail: String },

    BufferMergeFailed { block_start: Timestamp, error: String },
    BufferBucketsEvicted { block_start: Timestamp },

    IndexBlockSealed { block_start: Timestamp },
    IndexBlockEvicted { block_start: Timestamp },

    SeekerOpenFailed { shard: Shard, block_start: Timestamp, error: String },
    SeekerCloseFailed { shard: Shard, block_start: Timestamp, error: String },
    SeekerVolumeRotated { shard: Shard, block_start: Timestamp, volume: Volume },

    OpenCloseLoopStarted,
    OpenCloseLoopStopping,
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EventListener> {
    Arc::new(NoopEventListener)
}

/// Production-grade metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
pub mod db_metrics {
    use std::time::Duration;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Notes:
    // - Counters are exposed as `<name>_total` by the Prometheus exporter.
    // - Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const BUFFER_WRITES: &str = "tidemark_buffer_writes";
    pub const BUFFER_ENCODERS_CREATED: &str = "tidemark_buffer_encoders_created";
    pub const BUFFER_MERGES: &str = "tidemark_buffer_merges";
    pub const FLUSH_SEGMENT_BYTES: &str = "tidemark_flush_segment_bytes";

    pub const INDEX_QUERIES: &str = "tidemark_index_queries";
    pub const INDEX_BLOCKS_EVICTED: &str = "tidemark_index_blocks_evicted";

    pub const SEEKERS_OPENED: &str = "tidemark_seekers_opened";
    pub const SEEKERS_BORROWED: &str = "tidemark_seekers_borrowed";
    pub const LEASE_UPDATE_DURATION_SECONDS: &str = "tidemark_lease_update_duration_seconds";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process).
        pub fn install() -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;
            Ok(Self { handle })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
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
    pub fn record_buffer_write() {
        ::metrics::counter!(BUFFER_WRITES).increment(1);
    }

    #[inline]
    pub fn record_encoder_created() {
        ::metrics::counter!(BUFFER_ENCODERS_CREATED).increment(1);
    }

    #[inline]
    pub fn record_buffer_merges(merges: u64) {
        if merges > 0 {
            ::metrics::counter!(BUFFER_MERGES).increment(merges);
        }
    }

    #[inline]
    pub fn record_flush_segment_bytes(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(FLUSH_SEGMENT_BYTES).increment(bytes);
        }
    }

    #[inline]
    pub fn record_index_query() {
        ::metrics::counter!(INDEX_QUERIES).increment(1);
    }

    #[inline]
    pub fn record_index_blocks_evicted(evicted: u64) {
        if evicted > 0 {
            ::metrics::counter!(INDEX_BLOCKS_EVICTED).increment(evicted);
        }
    }

    #[inline]
    pub fn record_seeker_opened() {
        ::metrics::counter!(SEEKERS_OPENED).increment(1);
    }

    #[inline]
    pub fn record_seeker_borrowed() {
        ::metrics::counter!(SEEKERS_BORROWED).increment(1);
    }

    #[inline]
    pub fn record_lease_update(duration: Duration) {
        ::metrics::histogram!(LEASE_UPDATE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    fn describe_all() {
        describe_counter!(
            BUFFER_WRITES,
            Unit::Count,
            "Total number of datapoints written into series buffers."
        );
        describe_counter!(
            BUFFER_ENCODERS_CREATED,
            Unit::Count,
            "Total number of encoders allocated because no in-order encoder could accept a write."
        );
        describe_counter!(
            BUFFER_MERGES,
            Unit::Count,
            "Total number of bucket encoder merges performed by tick."
        );
        describe_counter!(
            FLUSH_SEGMENT_BYTES,
            Unit::Bytes,
            "Total bytes of merged segments handed to persist functions."
        );
        describe_counter!(
            INDEX_QUERIES,
            Unit::Count,
            "Total number of index queries served (term and aggregate)."
        );
        describe_counter!(
            INDEX_BLOCKS_EVICTED,
            Unit::Count,
            "Total number of index blocks evicted by retention."
        );
        describe_counter!(
            SEEKERS_OPENED,
            Unit::Count,
            "Total number of fileset seekers opened (originals, not clones)."
        );
        describe_counter!(
            SEEKERS_BORROWED,
            Unit::Count,
            "Total number of seeker borrows served."
        );
        describe_histogram!(
            LEASE_UPDATE_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end duration of open lease updates including the inactive seeker drain."
        );
    }
}
