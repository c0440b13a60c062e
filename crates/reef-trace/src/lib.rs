//! Distributed tracing for Reef.
//!
//! Spans are opened around every publish and every agent invocation. Their
//! context travels between agents inside spore metadata (`trace_id`,
//! `span_id`), so a chain of agents reacting to one broadcast lands in a
//! single trace. Finished spans go to a local SQLite [`TraceStore`] and,
//! when an OTLP endpoint is configured, to a collector.
//!
//! # Usage
//!
//! ```rust,ignore
//! use reef_trace::{ObservabilityConfig, SpanKind, SpanStatus, Tracer};
//!
//! let tracer = Tracer::new(&ObservabilityConfig::from_env()?)?;
//! let mut span = tracer.start_span("reef.broadcast", SpanKind::Producer, None);
//! span.set_attribute("spore.from", "researcher");
//! span.set_status(SpanStatus::Ok);
//! span.end();
//! ```

mod config;
mod context;
mod error;
mod export;
mod span;
mod store;
mod tracer;

pub use config::{EnableMode, Environment, ObservabilityConfig, DEFAULT_TRACES_PATH};
pub use context::{new_span_id, new_trace_id, SpanContext, SPAN_ID_KEY, TRACE_ID_KEY};
pub use error::TraceError;
pub use span::{
    Attributes, ParseSpanLabelError, Span, SpanEvent, SpanKind, SpanRecord, SpanStatus,
};
pub use store::{expand_path, SpanFilter, TraceStats, TraceStore, TraceSummary};
pub use tracer::{Tracer, TracerStats};
