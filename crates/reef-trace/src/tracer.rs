//! The tracer: sampling, span creation and the finish pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::RuntimeFlavor;

use crate::config::ObservabilityConfig;
use crate::context::{new_span_id, SpanContext};
use crate::error::TraceError;
use crate::export::OtlpExporter;
use crate::span::{Span, SpanKind, SpanRecord};
use crate::store::TraceStore;

/// Receives every span a tracer finishes.
pub(crate) struct Shared {
    store: Option<TraceStore>,
    exporter: Option<OtlpExporter>,
    finished: AtomicU64,
    store_errors: AtomicU64,
}

impl Shared {
    pub(crate) fn finish(&self, record: SpanRecord) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if let Some(store) = &self.store {
            if let Err(e) = off_worker(|| store.insert(&record)) {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    span = %record.name,
                    trace_id = %record.trace_id,
                    error = %e,
                    "failed to persist span"
                );
            }
        }
        if let Some(exporter) = &self.exporter {
            exporter.export(record);
        }
    }
}

/// Runs a blocking store write. On a multi-threaded runtime worker the
/// worker's other tasks move to another thread for the duration; elsewhere
/// `f` runs inline, since the read-after-end contract needs the row written
/// before `Span::end` returns.
fn off_worker<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Counters describing what a tracer has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TracerStats {
    pub spans_finished: u64,
    pub store_errors: u64,
    pub spans_exported: u64,
    pub export_errors: u64,
}

/// Creates spans. Clones share the same store and exporter.
#[derive(Clone)]
pub struct Tracer {
    shared: Arc<Shared>,
    enabled: bool,
    sample_rate: f64,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.enabled)
            .field("sample_rate", &self.sample_rate)
            .field("store", &self.shared.store)
            .field("exporting", &self.shared.exporter.is_some())
            .finish()
    }
}

impl Tracer {
    /// Builds a tracer from configuration, opening the span store at
    /// `traces_path` when tracing is enabled.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Config` for an invalid sample rate, or a store
    /// error when the trace file cannot be opened.
    pub fn new(config: &ObservabilityConfig) -> Result<Self, TraceError> {
        config.validate()?;
        if !config.is_enabled() {
            tracing::info!("tracing disabled");
            return Ok(Self::disabled());
        }
        let store = TraceStore::open(&config.traces_path)?;
        tracing::info!(path = ?store.path(), sample_rate = config.sample_rate, "tracing enabled");
        Ok(Self::build(config, Some(store)))
    }

    /// Builds a tracer around an already opened store.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Config` for an invalid sample rate.
    pub fn with_store(config: &ObservabilityConfig, store: TraceStore) -> Result<Self, TraceError> {
        config.validate()?;
        if !config.is_enabled() {
            return Ok(Self::disabled());
        }
        Ok(Self::build(config, Some(store)))
    }

    /// A tracer whose spans are all no-ops.
    pub fn disabled() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: None,
                exporter: None,
                finished: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
            }),
            enabled: false,
            sample_rate: 0.0,
        }
    }

    fn build(config: &ObservabilityConfig, store: Option<TraceStore>) -> Self {
        let exporter = config.otlp_endpoint.as_deref().and_then(|endpoint| {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    tracing::warn!(endpoint, "no tokio runtime; otlp export disabled");
                    return None;
                }
            };
            match OtlpExporter::spawn(endpoint, &config.service_name, &handle) {
                Ok(exporter) => Some(exporter),
                Err(e) => {
                    tracing::warn!(endpoint, error = %e, "failed to build otlp client");
                    None
                }
            }
        });

        Self {
            shared: Arc::new(Shared {
                store,
                exporter,
                finished: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
            }),
            enabled: true,
            sample_rate: config.sample_rate,
        }
    }

    /// True when spans may be recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The span store, if any.
    pub fn store(&self) -> Option<&TraceStore> {
        self.shared.store.as_ref()
    }

    /// Starts a span.
    ///
    /// With a `parent`, the span joins the parent's trace and is always
    /// recorded. Without one it starts a new trace, subject to sampling.
    pub fn start_span(&self, name: &str, kind: SpanKind, parent: Option<&SpanContext>) -> Span {
        if !self.enabled {
            return Span::noop();
        }
        match parent {
            Some(parent) => Span::start(
                Arc::clone(&self.shared),
                name,
                kind,
                SpanContext {
                    trace_id: parent.trace_id.clone(),
                    span_id: new_span_id(),
                },
                Some(parent.span_id.clone()),
            ),
            None if self.sample() => Span::start(
                Arc::clone(&self.shared),
                name,
                kind,
                SpanContext::new_root(),
                None,
            ),
            None => Span::noop(),
        }
    }

    fn sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            true
        } else if self.sample_rate <= 0.0 {
            false
        } else {
            rand::random::<f64>() < self.sample_rate
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TracerStats {
        let (spans_exported, export_errors) = match &self.shared.exporter {
            Some(exporter) => (
                exporter.counters.exported.load(Ordering::Relaxed),
                exporter.counters.failed.load(Ordering::Relaxed),
            ),
            None => (0, 0),
        };
        TracerStats {
            spans_finished: self.shared.finished.load(Ordering::Relaxed),
            store_errors: self.shared.store_errors.load(Ordering::Relaxed),
            spans_exported,
            export_errors,
        }
    }
}
