//! OTLP/HTTP JSON export of finished spans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::span::{Attributes, SpanKind, SpanRecord, SpanStatus};

const MAX_BATCH: usize = 128;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub(crate) struct ExportCounters {
    pub(crate) exported: AtomicU64,
    pub(crate) failed: AtomicU64,
}

/// Queues finished spans for a background task that posts them in batches.
pub(crate) struct OtlpExporter {
    tx: mpsc::UnboundedSender<SpanRecord>,
    pub(crate) counters: Arc<ExportCounters>,
}

impl OtlpExporter {
    pub(crate) fn spawn(
        endpoint: &str,
        service_name: &str,
        handle: &tokio::runtime::Handle,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let url = traces_url(endpoint);
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ExportCounters::default());

        handle.spawn(export_loop(
            rx,
            client,
            url,
            service_name.to_string(),
            Arc::clone(&counters),
        ));

        Ok(Self { tx, counters })
    }

    pub(crate) fn export(&self, record: SpanRecord) {
        if self.tx.send(record).is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub(crate) fn traces_url(endpoint: &str) -> String {
    format!("{}/v1/traces", endpoint.trim_end_matches('/'))
}

async fn export_loop(
    mut rx: mpsc::UnboundedReceiver<SpanRecord>,
    client: reqwest::Client,
    url: String,
    service_name: String,
    counters: Arc<ExportCounters>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        let body = otlp_payload(&service_name, &batch);
        let result = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => {
                counters
                    .exported
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                counters
                    .failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::warn!(url = %url, spans = batch.len(), error = %e, "otlp export failed");
            }
        }
    }
    tracing::debug!(url = %url, "otlp exporter stopped");
}

fn kind_code(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
        SpanKind::Producer => 4,
        SpanKind::Consumer => 5,
    }
}

fn status_code(status: SpanStatus) -> u8 {
    match status {
        SpanStatus::Unset => 0,
        SpanStatus::Ok => 1,
        SpanStatus::Error => 2,
    }
}

fn any_value(value: &Value) -> Value {
    match value {
        Value::String(s) => json!({ "stringValue": s }),
        Value::Bool(b) => json!({ "boolValue": b }),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!({ "intValue": n.to_string() }),
        Value::Number(n) => json!({ "doubleValue": n.as_f64() }),
        other => json!({ "stringValue": other.to_string() }),
    }
}

fn key_values(attributes: &Attributes) -> Vec<Value> {
    attributes
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": any_value(value) }))
        .collect()
}

/// Builds an OTLP `ExportTraceServiceRequest` in its JSON encoding.
pub(crate) fn otlp_payload(service_name: &str, spans: &[SpanRecord]) -> Value {
    let spans: Vec<Value> = spans
        .iter()
        .map(|span| {
            let events: Vec<Value> = span
                .events
                .iter()
                .map(|event| {
                    json!({
                        "timeUnixNano": event.timestamp_ns.to_string(),
                        "name": event.name,
                        "attributes": key_values(&event.attributes),
                    })
                })
                .collect();
            json!({
                "traceId": span.trace_id,
                "spanId": span.span_id,
                "parentSpanId": span.parent_span_id.clone().unwrap_or_default(),
                "name": span.name,
                "kind": kind_code(span.kind),
                "startTimeUnixNano": span.start_ns.to_string(),
                "endTimeUnixNano": span.end_ns.to_string(),
                "attributes": key_values(&span.attributes),
                "events": events,
                "status": { "code": status_code(span.status) },
            })
        })
        .collect();

    json!({
        "resourceSpans": [{
            "resource": {
                "attributes": [
                    { "key": "service.name", "value": { "stringValue": service_name } }
                ]
            },
            "scopeSpans": [{
                "scope": { "name": "reef", "version": env!("CARGO_PKG_VERSION") },
                "spans": spans,
            }]
        }]
    })
}
