//! Trace context carried between agents in spore metadata.

use std::collections::BTreeMap;

/// Metadata key holding the 32-hex-char trace id.
pub const TRACE_ID_KEY: &str = "trace_id";
/// Metadata key holding the 16-hex-char span id of the producer.
pub const SPAN_ID_KEY: &str = "span_id";

const TRACE_ID_LEN: usize = 32;
const SPAN_ID_LEN: usize = 16;

/// Identifies a span within a trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpanContext {
    /// 128-bit trace id, lowercase hex.
    pub trace_id: String,
    /// 64-bit span id, lowercase hex.
    pub span_id: String,
}

impl SpanContext {
    /// A fresh context starting a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
        }
    }

    /// A fresh span id in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    /// True when both ids have the right length, are hex and are not all zero.
    pub fn is_valid(&self) -> bool {
        valid_id(&self.trace_id, TRACE_ID_LEN) && valid_id(&self.span_id, SPAN_ID_LEN)
    }

    /// Writes `trace_id` and `span_id` into spore metadata.
    pub fn inject(&self, metadata: &mut BTreeMap<String, String>) {
        metadata.insert(TRACE_ID_KEY.to_string(), self.trace_id.clone());
        metadata.insert(SPAN_ID_KEY.to_string(), self.span_id.clone());
    }

    /// Reads a context from spore metadata. Missing or malformed ids yield `None`.
    pub fn extract(metadata: &BTreeMap<String, String>) -> Option<Self> {
        let context = Self {
            trace_id: metadata.get(TRACE_ID_KEY)?.to_ascii_lowercase(),
            span_id: metadata.get(SPAN_ID_KEY)?.to_ascii_lowercase(),
        };
        context.is_valid().then_some(context)
    }
}

fn valid_id(id: &str, len: usize) -> bool {
    id.len() == len
        && id.bytes().all(|b| b.is_ascii_hexdigit())
        && id.bytes().any(|b| b != b'0')
}

/// A random 128-bit trace id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A random 64-bit span id.
pub fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SPAN_ID_LEN);
    if id.bytes().all(|b| b == b'0') {
        id.replace_range(SPAN_ID_LEN - 1.., "1");
    }
    id
}
