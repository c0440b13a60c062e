//! Broker frame codec.
//!
//! A [`BrokerMessage`] is the transport-neutral shape of an AMQP message:
//! a JSON body, a handful of basic properties and a flat string header
//! table. Backends translate it into their client library's types.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::WireError;
use crate::spore::{Knowledge, Spore, SporeType, PRIORITY_NORMAL};

/// Content type of every encoded body.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// AMQP delivery mode for persistent messages.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Wire format version carried in the `version` header.
pub const WIRE_VERSION: &str = "1.0";
/// Knowledge key used when the body cannot be parsed as a JSON object.
pub const RAW_CONTENT_KEY: &str = "raw_content";

/// Header names owned by the codec.
pub mod headers {
    /// Spore id.
    pub const SPORE_ID: &str = "spore_id";
    /// Spore type label.
    pub const SPORE_TYPE: &str = "spore_type";
    /// Producing agent.
    pub const FROM_AGENT: &str = "from_agent";
    /// Target agent, empty for broadcasts.
    pub const TO_AGENT: &str = "to_agent";
    /// Decimal priority.
    pub const PRIORITY: &str = "priority";
    /// RFC 3339 creation time.
    pub const CREATED_AT: &str = "created_at";
    /// Correlated spore id, empty when absent.
    pub const REPLY_TO: &str = "reply_to";
    /// RFC 3339 expiry, only present when set.
    pub const EXPIRES_AT: &str = "expires_at";
    /// Wire format version.
    pub const VERSION: &str = "version";

    /// Every reserved header name.
    pub const RESERVED: &[&str] = &[
        SPORE_ID, SPORE_TYPE, FROM_AGENT, TO_AGENT, PRIORITY, CREATED_AT, REPLY_TO, EXPIRES_AT,
        VERSION,
    ];

    /// True when `name` is owned by the codec.
    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

/// A message as handed to, or received from, a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// UTF-8 JSON body.
    pub body: Vec<u8>,
    /// MIME type of the body.
    pub content_type: String,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: u8,
    /// Broker-level message id.
    pub message_id: Option<String>,
    /// Broker priority.
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Flat string headers.
    pub headers: BTreeMap<String, String>,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Encodes a spore into a broker frame.
///
/// # Errors
///
/// Returns [`WireError::Expired`] when `expires_at` already lies before
/// `now`; such a spore must not be published.
pub fn encode(spore: &Spore, now: DateTime<Utc>) -> Result<BrokerMessage, WireError> {
    let expiration_ms = match spore.expires_at {
        Some(expires_at) if expires_at < now => {
            return Err(WireError::Expired {
                spore_id: spore.id().to_string(),
                expired_at: format_timestamp(&expires_at),
            });
        }
        Some(expires_at) => {
            Some(u64::try_from((expires_at - now).num_milliseconds()).unwrap_or(0))
        }
        None => None,
    };

    let body = serde_json::to_vec(&spore.knowledge)?;

    let mut table: BTreeMap<String, String> = spore
        .metadata
        .iter()
        .filter(|(key, _)| !headers::is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    table.insert(headers::SPORE_ID.into(), spore.id().to_string());
    table.insert(headers::SPORE_TYPE.into(), spore.spore_type.as_str().into());
    table.insert(headers::FROM_AGENT.into(), spore.from_agent.clone());
    table.insert(
        headers::TO_AGENT.into(),
        spore.to_agent.clone().unwrap_or_default(),
    );
    table.insert(headers::PRIORITY.into(), spore.priority().to_string());
    table.insert(
        headers::CREATED_AT.into(),
        format_timestamp(&spore.created_at),
    );
    table.insert(
        headers::REPLY_TO.into(),
        spore.reply_to.clone().unwrap_or_default(),
    );
    if let Some(expires_at) = &spore.expires_at {
        table.insert(headers::EXPIRES_AT.into(), format_timestamp(expires_at));
    }
    table.insert(headers::VERSION.into(), WIRE_VERSION.into());

    Ok(BrokerMessage {
        body,
        content_type: CONTENT_TYPE_JSON.into(),
        delivery_mode: DELIVERY_MODE_PERSISTENT,
        message_id: Some(spore.id().to_string()),
        priority: Some(spore.priority()),
        expiration_ms,
        headers: table,
    })
}

fn decode_body(body: &[u8]) -> Knowledge {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut knowledge = Knowledge::new();
            knowledge.insert(
                RAW_CONTENT_KEY.into(),
                Value::String(String::from_utf8_lossy(body).into_owned()),
            );
            knowledge
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Decodes a broker frame into a spore.
///
/// Decoding never fails. Unknown types decode as `knowledge`, a body that is
/// not a JSON object is wrapped under `raw_content`, an unreadable
/// `created_at` becomes the current time and a missing id falls back to the
/// broker message id, then to a fresh UUID.
pub fn decode(message: &BrokerMessage) -> Spore {
    let h = &message.headers;

    let id = non_empty(h.get(headers::SPORE_ID))
        .or_else(|| message.message_id.clone().filter(|id| !id.is_empty()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let spore_type = h
        .get(headers::SPORE_TYPE)
        .and_then(|raw| raw.parse::<SporeType>().ok())
        .unwrap_or(SporeType::Knowledge);

    let from_agent = h.get(headers::FROM_AGENT).cloned().unwrap_or_default();
    let to_agent = non_empty(h.get(headers::TO_AGENT));

    let mut spore = Spore::with_id(id, spore_type, from_agent, to_agent, decode_body(&message.body));

    let priority = h
        .get(headers::PRIORITY)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .or(message.priority.map(i64::from))
        .unwrap_or(i64::from(PRIORITY_NORMAL));
    spore.set_priority(priority);

    spore.created_at = h
        .get(headers::CREATED_AT)
        .and_then(|raw| parse_timestamp(raw))
        .unwrap_or_else(Utc::now);
    spore.expires_at = h.get(headers::EXPIRES_AT).and_then(|raw| parse_timestamp(raw));
    spore.reply_to = non_empty(h.get(headers::REPLY_TO));

    spore.metadata = h
        .iter()
        .filter(|(key, _)| !headers::is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    spore
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spore::knowledge;
    use chrono::TimeDelta;
    use serde_json::json;

    fn sample() -> Spore {
        Spore::new(
            SporeType::Request,
            "researcher",
            Some("analyst".into()),
            knowledge(json!({"type": "query", "topic": "reefs", "depth": 3, "tags": ["a", "b"]})),
        )
        .with_priority(7)
        .with_reply_to("origin-1")
        .with_metadata("trace_id", "0af7651916cd43dd8448eb211c80319c")
        .with_metadata("channel", "agent.analyst")
    }

    // ── encode ──

    #[test]
    fn encode_sets_properties_and_reserved_headers() {
        let spore = sample();
        let msg = encode(&spore, Utc::now()).expect("should encode");

        assert_eq!(msg.content_type, CONTENT_TYPE_JSON);
        assert_eq!(msg.delivery_mode, DELIVERY_MODE_PERSISTENT);
        assert_eq!(msg.message_id.as_deref(), Some(spore.id()));
        assert_eq!(msg.priority, Some(7));
        assert_eq!(msg.expiration_ms, None);

        assert_eq!(msg.headers["spore_type"], "request");
        assert_eq!(msg.headers["from_agent"], "researcher");
        assert_eq!(msg.headers["to_agent"], "analyst");
        assert_eq!(msg.headers["priority"], "7");
        assert_eq!(msg.headers["reply_to"], "origin-1");
        assert_eq!(msg.headers["version"], "1.0");
        assert_eq!(msg.headers["channel"], "agent.analyst");
        assert!(!msg.headers.contains_key("expires_at"));
    }

    #[test]
    fn encode_broadcast_uses_empty_strings_for_absent_fields() {
        let spore = Spore::broadcast("a", Knowledge::new());
        let msg = encode(&spore, Utc::now()).expect("should encode");
        assert_eq!(msg.headers["to_agent"], "");
        assert_eq!(msg.headers["reply_to"], "");
    }

    #[test]
    fn reserved_headers_win_over_metadata() {
        let spore = Spore::broadcast("a", Knowledge::new()).with_metadata("from_agent", "spoofed");
        let msg = encode(&spore, Utc::now()).expect("should encode");
        assert_eq!(msg.headers["from_agent"], "a");
    }

    #[test]
    fn encode_rejects_expired_spore() {
        let now = Utc::now();
        let spore =
            Spore::broadcast("a", Knowledge::new()).with_expires_at(now - TimeDelta::seconds(5));
        let err = encode(&spore, now).expect_err("expired spore should not encode");
        assert!(matches!(err, WireError::Expired { .. }));
    }

    #[test]
    fn encode_computes_remaining_ttl() {
        let now = Utc::now();
        let spore =
            Spore::broadcast("a", Knowledge::new()).with_expires_at(now + TimeDelta::seconds(30));
        let msg = encode(&spore, now).expect("should encode");
        assert_eq!(msg.expiration_ms, Some(30_000));
        assert!(msg.headers.contains_key("expires_at"));
    }

    #[test]
    fn priority_ten_fits_broker_range() {
        let spore = Spore::broadcast("a", Knowledge::new()).with_priority(10);
        let msg = encode(&spore, Utc::now()).expect("should encode");
        assert_eq!(msg.priority, Some(10));
        assert_eq!(decode(&msg).priority(), 10);
    }

    // ── round trip ──

    #[test]
    fn three_cycles_preserve_every_field() {
        let now = Utc::now();
        let original = sample().with_expires_at(now + TimeDelta::hours(1));

        let mut current = original.clone();
        for _ in 0..3 {
            let msg = encode(&current, now).expect("should encode");
            current = decode(&msg);
        }

        assert_eq!(current, original);
    }

    // ── tolerant decode ──

    fn bare(body: &[u8]) -> BrokerMessage {
        BrokerMessage {
            body: body.to_vec(),
            content_type: CONTENT_TYPE_JSON.into(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            message_id: None,
            priority: None,
            expiration_ms: None,
            headers: BTreeMap::new(),
        }
    }

    #[test]
    fn non_json_body_is_wrapped_as_raw_content() {
        let spore = decode(&bare(b"plain text"));
        assert_eq!(spore.knowledge["raw_content"], json!("plain text"));
    }

    #[test]
    fn non_object_json_body_is_wrapped_as_raw_content() {
        let spore = decode(&bare(b"[1,2,3]"));
        assert_eq!(spore.knowledge["raw_content"], json!("[1,2,3]"));
    }

    #[test]
    fn unknown_type_decodes_as_knowledge() {
        let mut msg = bare(b"{}");
        msg.headers.insert("spore_type".into(), "gossip".into());
        assert_eq!(decode(&msg).spore_type, SporeType::Knowledge);
    }

    #[test]
    fn bad_created_at_falls_back_to_now() {
        let before = Utc::now();
        let mut msg = bare(b"{}");
        msg.headers.insert("created_at".into(), "yesterday".into());
        let spore = decode(&msg);
        assert!(spore.created_at >= before);
    }

    #[test]
    fn id_falls_back_to_message_id_then_fresh() {
        let mut msg = bare(b"{}");
        msg.message_id = Some("broker-id".into());
        assert_eq!(decode(&msg).id(), "broker-id");

        let spore = decode(&bare(b"{}"));
        assert!(uuid::Uuid::parse_str(spore.id()).is_ok());
    }

    #[test]
    fn priority_falls_back_to_broker_then_normal() {
        let mut msg = bare(b"{}");
        msg.priority = Some(9);
        assert_eq!(decode(&msg).priority(), 9);

        assert_eq!(decode(&bare(b"{}")).priority(), PRIORITY_NORMAL);

        let mut msg = bare(b"{}");
        msg.headers.insert("priority".into(), "200".into());
        assert_eq!(decode(&msg).priority(), 10);
    }

    #[test]
    fn unreserved_headers_become_metadata() {
        let mut msg = bare(b"{}");
        msg.headers.insert("span_id".into(), "b7ad6b7169203331".into());
        msg.headers.insert("version".into(), "1.0".into());
        let spore = decode(&msg);
        assert_eq!(spore.metadata.get("span_id").map(String::as_str), Some("b7ad6b7169203331"));
        assert!(!spore.metadata.contains_key("version"));
    }
}
