//! The spore envelope and its type tag.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SporeError;

/// The payload of a spore: a JSON object keyed by strings.
pub type Knowledge = serde_json::Map<String, Value>;

/// Lowest accepted priority.
pub const PRIORITY_MIN: u8 = 1;
/// Highest accepted priority.
pub const PRIORITY_MAX: u8 = 10;
/// Priority used when none is given.
pub const PRIORITY_NORMAL: u8 = 5;
/// Priorities at or above this value are considered urgent.
pub const PRIORITY_HIGH: u8 = 8;

/// Knowledge key consulted by subscription filters.
pub const KNOWLEDGE_TYPE_KEY: &str = "type";

/// Well-known metadata keys.
pub mod metadata_keys {
    /// Channel the spore was published on.
    pub const CHANNEL: &str = "channel";
    /// 128-bit hex trace identifier.
    pub const TRACE_ID: &str = "trace_id";
    /// 64-bit hex span identifier of the producing span.
    pub const SPAN_ID: &str = "span_id";
}

/// The kind of message a spore carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SporeType {
    /// Plain knowledge handed to another agent.
    Knowledge,
    /// A request that expects a `Response`.
    Request,
    /// An answer correlated through `reply_to`.
    Response,
    /// Fan-out to every subscriber of a channel.
    Broadcast,
    /// Fire-and-forget status information.
    Notification,
}

impl SporeType {
    /// Returns the canonical lowercase label used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge",
            Self::Request => "request",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for SporeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SporeType {
    type Err = ParseSporeTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "knowledge" => Ok(Self::Knowledge),
            "request" => Ok(Self::Request),
            "response" => Ok(Self::Response),
            "broadcast" => Ok(Self::Broadcast),
            "notification" => Ok(Self::Notification),
            _ => Err(ParseSporeTypeError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown spore type label.
#[derive(Debug, Clone)]
pub struct ParseSporeTypeError(pub String);

impl std::fmt::Display for ParseSporeTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown spore type: {}", self.0)
    }
}

impl std::error::Error for ParseSporeTypeError {}

/// The universal message envelope exchanged between agents.
///
/// A spore is created by the dispatch core when an agent sends, broadcasts,
/// requests or replies. Only the dispatch core touches `metadata` before the
/// spore is handed to a backend; once delivered it is treated as read-only.
///
/// The identifier is fixed at construction and has no setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spore {
    id: String,
    /// What kind of message this is.
    pub spore_type: SporeType,
    /// Name of the producing agent.
    pub from_agent: String,
    /// Target agent, `None` for broadcasts.
    pub to_agent: Option<String>,
    /// The JSON payload.
    pub knowledge: Knowledge,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// After this instant the spore must not be delivered.
    pub expires_at: Option<DateTime<Utc>>,
    priority: u8,
    /// Id of the spore this one answers.
    pub reply_to: Option<String>,
    /// Cross-cutting string annotations (trace context, channel).
    pub metadata: BTreeMap<String, String>,
}

impl Spore {
    /// Creates a spore with a fresh UUID v4 id, normal priority and no expiry.
    pub fn new(
        spore_type: SporeType,
        from_agent: impl Into<String>,
        to_agent: Option<String>,
        knowledge: Knowledge,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            spore_type,
            from_agent,
            to_agent,
            knowledge,
        )
    }

    /// Creates a spore with a caller-chosen id.
    ///
    /// Used by the wire decoder and by callers that must know the id before
    /// the spore is published (request correlation).
    pub fn with_id(
        id: impl Into<String>,
        spore_type: SporeType,
        from_agent: impl Into<String>,
        to_agent: Option<String>,
        knowledge: Knowledge,
    ) -> Self {
        Self {
            id: id.into(),
            spore_type,
            from_agent: from_agent.into(),
            to_agent,
            knowledge,
            created_at: Utc::now(),
            expires_at: None,
            priority: PRIORITY_NORMAL,
            reply_to: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A `knowledge` spore addressed to one agent.
    pub fn direct(from: impl Into<String>, to: impl Into<String>, knowledge: Knowledge) -> Self {
        Self::new(SporeType::Knowledge, from, Some(to.into()), knowledge)
    }

    /// A `broadcast` spore with no target agent.
    pub fn broadcast(from: impl Into<String>, knowledge: Knowledge) -> Self {
        Self::new(SporeType::Broadcast, from, None, knowledge)
    }

    /// A `response` spore answering `reply_to`.
    pub fn response(
        from: impl Into<String>,
        to: impl Into<String>,
        knowledge: Knowledge,
        reply_to: impl Into<String>,
    ) -> Self {
        Self::new(SporeType::Response, from, Some(to.into()), knowledge).with_reply_to(reply_to)
    }

    /// The immutable spore identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Priority in `1..=10`.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Sets the priority, clamped into `1..=10`.
    pub fn set_priority(&mut self, priority: i64) {
        self.priority = clamp_priority(priority);
    }

    /// Builder form of [`Spore::set_priority`].
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.set_priority(priority);
        self
    }

    /// Sets `reply_to`.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets an absolute expiry.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the expiry relative to `created_at`.
    ///
    /// A TTL too large to represent leaves the spore without expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| self.created_at.checked_add_signed(delta));
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The reserved `knowledge.type` string, if present.
    pub fn knowledge_type(&self) -> Option<&str> {
        self.knowledge.get(KNOWLEDGE_TYPE_KEY).and_then(Value::as_str)
    }

    /// True when the spore has no target agent.
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }

    /// True for priority 8 and above.
    pub fn is_high_priority(&self) -> bool {
        self.priority >= PRIORITY_HIGH
    }

    /// True when `expires_at` lies before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// The channel the dispatch core stamped on this spore, if any.
    pub fn channel(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::CHANNEL)
            .map(String::as_str)
    }

    /// Checks the envelope invariants.
    ///
    /// # Errors
    ///
    /// Returns `SporeError` when a response lacks `reply_to`, a broadcast
    /// names a target, or the sender is empty.
    pub fn validate(&self) -> Result<(), SporeError> {
        if self.from_agent.is_empty() {
            return Err(SporeError::MissingSender(self.id.clone()));
        }
        if self.spore_type == SporeType::Response && self.reply_to.is_none() {
            return Err(SporeError::MissingReplyTo(self.id.clone()));
        }
        if self.spore_type == SporeType::Broadcast {
            if let Some(to_agent) = &self.to_agent {
                return Err(SporeError::BroadcastWithTarget {
                    id: self.id.clone(),
                    to_agent: to_agent.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Clamps an arbitrary integer into the accepted priority range.
pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(i64::from(PRIORITY_MIN), i64::from(PRIORITY_MAX)) as u8
}

/// Builds a [`Knowledge`] map from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty map.
pub fn knowledge(value: Value) -> Knowledge {
    match value {
        Value::Object(map) => map,
        _ => Knowledge::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spore_type_labels_round_trip() {
        for ty in [
            SporeType::Knowledge,
            SporeType::Request,
            SporeType::Response,
            SporeType::Broadcast,
            SporeType::Notification,
        ] {
            assert_eq!(ty.as_str().parse::<SporeType>().unwrap(), ty);
        }
        assert!("gossip".parse::<SporeType>().is_err());
    }

    #[test]
    fn new_spores_get_distinct_ids() {
        let a = Spore::broadcast("a", Knowledge::new());
        let b = Spore::broadcast("a", Knowledge::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.priority(), PRIORITY_NORMAL);
    }

    #[test]
    fn priority_is_clamped() {
        let spore = Spore::broadcast("a", Knowledge::new()).with_priority(42);
        assert_eq!(spore.priority(), PRIORITY_MAX);
        assert!(spore.is_high_priority());

        let spore = Spore::broadcast("a", Knowledge::new()).with_priority(-3);
        assert_eq!(spore.priority(), PRIORITY_MIN);
    }

    #[test]
    fn response_without_reply_to_is_invalid() {
        let spore = Spore::new(SporeType::Response, "r", Some("q".into()), Knowledge::new());
        assert_eq!(
            spore.validate(),
            Err(SporeError::MissingReplyTo(spore.id().to_string()))
        );

        let ok = Spore::response("r", "q", Knowledge::new(), "abc");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn broadcast_with_target_is_invalid() {
        let spore = Spore::new(SporeType::Broadcast, "a", Some("b".into()), Knowledge::new());
        assert!(matches!(
            spore.validate(),
            Err(SporeError::BroadcastWithTarget { ref to_agent, .. }) if to_agent == "b"
        ));
    }

    #[test]
    fn empty_sender_is_invalid() {
        let spore = Spore::broadcast("", Knowledge::new());
        assert!(matches!(spore.validate(), Err(SporeError::MissingSender(_))));
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let now = Utc::now();
        let past = Spore::broadcast("a", Knowledge::new())
            .with_expires_at(now - TimeDelta::seconds(1));
        assert!(past.is_expired(now));

        let future = Spore::broadcast("a", Knowledge::new()).with_ttl(Duration::from_secs(60));
        assert!(!future.is_expired(now));

        let never = Spore::broadcast("a", Knowledge::new());
        assert!(!never.is_expired(now));
    }

    #[test]
    fn knowledge_type_reads_reserved_key() {
        let spore = Spore::broadcast("a", knowledge(json!({"type": "query", "topic": "x"})));
        assert_eq!(spore.knowledge_type(), Some("query"));

        let untyped = Spore::broadcast("a", knowledge(json!({"type": 7})));
        assert_eq!(untyped.knowledge_type(), None);
    }

    #[test]
    fn knowledge_helper_ignores_non_objects() {
        assert!(knowledge(json!([1, 2, 3])).is_empty());
        assert_eq!(knowledge(json!({"a": 1})).len(), 1);
    }
}
