//! Spans and finished span records.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::SpanContext;
use crate::tracer::Shared;

/// String-keyed JSON attributes attached to spans and events.
pub type Attributes = serde_json::Map<String, Value>;

/// The role a span plays in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Work internal to one agent.
    Internal,
    /// An outbound call to a collaborator (LLM, storage).
    Client,
    /// Handling of an incoming spore.
    Server,
    /// Publication of a spore.
    Producer,
    /// Consumption from a queue.
    Consumer,
}

impl SpanKind {
    /// Returns the canonical lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Client => "client",
            Self::Server => "server",
            Self::Producer => "producer",
            Self::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpanKind {
    type Err = ParseSpanLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            "producer" => Ok(Self::Producer),
            "consumer" => Ok(Self::Consumer),
            _ => Err(ParseSpanLabelError(s.to_string())),
        }
    }
}

/// Outcome of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// No outcome recorded.
    #[default]
    Unset,
    /// Completed successfully.
    Ok,
    /// Completed with an error.
    Error,
}

impl SpanStatus {
    /// Returns the canonical lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpanStatus {
    type Err = ParseSpanLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(Self::Unset),
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            _ => Err(ParseSpanLabelError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown span kind or status label.
#[derive(Debug, Clone)]
pub struct ParseSpanLabelError(pub String);

impl std::fmt::Display for ParseSpanLabelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown span label: {}", self.0)
    }
}

impl std::error::Error for ParseSpanLabelError {}

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name, `exception` for recorded errors.
    pub name: String,
    /// Unix time in nanoseconds.
    pub timestamp_ns: i64,
    /// Event attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

/// A finished, immutable span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_ns: i64,
    pub end_ns: i64,
    pub duration_ms: f64,
    pub status: SpanStatus,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
}

impl SpanRecord {
    /// The context identifying this span.
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }

    /// Looks up one attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Looks up a string attribute.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

pub(crate) fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

struct Recording {
    record: SpanRecord,
    started: Instant,
    shared: Arc<Shared>,
}

/// A span in progress.
///
/// A `Span` either records or is a no-op. No-op spans come from a disabled
/// tracer or an unsampled root; every method on them returns immediately.
/// A recording span ends exactly once, on the first call to [`Span::end`]
/// or when dropped, and is then handed to the store and exporter.
#[must_use = "a span ends when dropped"]
pub struct Span {
    inner: Option<Box<Recording>>,
}

impl Span {
    /// A span that records nothing.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn start(
        shared: Arc<Shared>,
        name: &str,
        kind: SpanKind,
        context: SpanContext,
        parent_span_id: Option<String>,
    ) -> Self {
        let record = SpanRecord {
            trace_id: context.trace_id,
            span_id: context.span_id,
            parent_span_id,
            name: name.to_string(),
            kind,
            start_ns: now_ns(),
            end_ns: 0,
            duration_ms: 0.0,
            status: SpanStatus::Unset,
            attributes: Attributes::new(),
            events: Vec::new(),
        };
        Self {
            inner: Some(Box::new(Recording {
                record,
                started: Instant::now(),
                shared,
            })),
        }
    }

    /// True until the span ends; always false for no-op spans.
    pub fn is_recording(&self) -> bool {
        self.inner.is_some()
    }

    /// The context to propagate to children, `None` when not recording.
    pub fn context(&self) -> Option<SpanContext> {
        self.inner.as_ref().map(|r| r.record.context())
    }

    /// Sets an attribute.
    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        if let Some(recording) = self.inner.as_mut() {
            recording
                .record
                .attributes
                .insert(key.to_string(), value.into());
        }
    }

    /// Appends a timestamped event.
    pub fn add_event(&mut self, name: &str, attributes: Attributes) {
        if let Some(recording) = self.inner.as_mut() {
            recording.record.events.push(SpanEvent {
                name: name.to_string(),
                timestamp_ns: now_ns(),
                attributes,
            });
        }
    }

    /// Records an `exception` event carrying the error message.
    ///
    /// The status is left untouched; callers set it separately.
    pub fn record_exception(&mut self, error: &(dyn std::error::Error + 'static)) {
        if self.inner.is_none() {
            return;
        }
        let mut attributes = Attributes::new();
        attributes.insert("exception.message".into(), Value::String(error.to_string()));
        if let Some(source) = error.source() {
            attributes.insert("exception.cause".into(), Value::String(source.to_string()));
        }
        self.add_event("exception", attributes);
    }

    /// Sets the outcome.
    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(recording) = self.inner.as_mut() {
            recording.record.status = status;
        }
    }

    /// Ends the span. Later calls do nothing.
    pub fn end(&mut self) {
        let Some(recording) = self.inner.take() else {
            return;
        };
        let Recording {
            mut record,
            started,
            shared,
        } = *recording;

        let elapsed = started.elapsed();
        record.duration_ms = elapsed.as_secs_f64() * 1000.0;
        record.end_ns = record
            .start_ns
            .saturating_add(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX));

        shared.finish(record);
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(recording) => f
                .debug_struct("Span")
                .field("name", &recording.record.name)
                .field("trace_id", &recording.record.trace_id)
                .field("span_id", &recording.record.span_id)
                .finish(),
            None => f.write_str("Span(noop)"),
        }
    }
}
