//! Builder for spores about to be published.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reef_trace::SpanContext;
use reef_types::{Knowledge, Spore, SporeType, PRIORITY_NORMAL};

/// Everything [`crate::Reef::publish`] needs to build and route a spore.
#[derive(Debug, Clone)]
pub struct OutgoingSpore {
    pub(crate) id: Option<String>,
    pub(crate) spore_type: SporeType,
    pub(crate) from_agent: String,
    pub(crate) to_agent: Option<String>,
    pub(crate) knowledge: Knowledge,
    pub(crate) channel: Option<String>,
    pub(crate) priority: i64,
    pub(crate) ttl: Option<Duration>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) reply_to: Option<String>,
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) parent: Option<SpanContext>,
}

impl OutgoingSpore {
    /// A spore of any type. Prefer the typed constructors below.
    pub fn new(
        spore_type: SporeType,
        from_agent: impl Into<String>,
        to_agent: Option<String>,
        knowledge: Knowledge,
    ) -> Self {
        Self {
            id: None,
            spore_type,
            from_agent: from_agent.into(),
            to_agent,
            knowledge,
            channel: None,
            priority: i64::from(PRIORITY_NORMAL),
            ttl: None,
            expires_at: None,
            reply_to: None,
            metadata: BTreeMap::new(),
            parent: None,
        }
    }

    /// A `knowledge` spore for one agent.
    pub fn direct(from: impl Into<String>, to: impl Into<String>, knowledge: Knowledge) -> Self {
        Self::new(SporeType::Knowledge, from, Some(to.into()), knowledge)
    }

    /// A `broadcast` spore on the default channel.
    pub fn broadcast(from: impl Into<String>, knowledge: Knowledge) -> Self {
        Self::new(SporeType::Broadcast, from, None, knowledge)
    }

    /// A `request` spore for one agent.
    pub fn request(from: impl Into<String>, to: impl Into<String>, knowledge: Knowledge) -> Self {
        Self::new(SporeType::Request, from, Some(to.into()), knowledge)
    }

    /// A `response` answering `reply_to`.
    pub fn response(
        from: impl Into<String>,
        to: impl Into<String>,
        knowledge: Knowledge,
        reply_to: impl Into<String>,
    ) -> Self {
        Self::new(SporeType::Response, from, Some(to.into()), knowledge).reply_to(reply_to)
    }

    /// Fixes the spore id instead of generating one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Publishes on `channel` instead of the type's default.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Priority, clamped into `1..=10` when the spore is built.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Expires the spore `ttl` after it is built.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Absolute expiry; wins over [`OutgoingSpore::ttl`].
    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Id of the request this spore answers.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Adds a metadata entry. Trace and channel keys are overwritten at
    /// publish.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parents the producer span on `parent`.
    pub fn parent(mut self, parent: Option<SpanContext>) -> Self {
        self.parent = parent;
        self
    }

    /// The channel this spore goes to: the explicit one, else `agent.<to>`
    /// for addressed spores, else `default_channel`.
    pub fn resolve_channel(&self, default_channel: &str) -> String {
        match (&self.channel, &self.to_agent) {
            (Some(channel), _) => channel.clone(),
            (None, Some(to)) => reef_backend::agent_channel(to),
            (None, None) => default_channel.to_string(),
        }
    }

    pub(crate) fn build(self) -> (Spore, Option<SpanContext>) {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut spore = Spore::with_id(
            id,
            self.spore_type,
            self.from_agent,
            self.to_agent,
            self.knowledge,
        )
        .with_priority(self.priority);
        if let Some(expires_at) = self.expires_at {
            spore = spore.with_expires_at(expires_at);
        } else if let Some(ttl) = self.ttl {
            spore = spore.with_ttl(ttl);
        }
        spore.reply_to = self.reply_to;
        spore.metadata.extend(self.metadata);
        (spore, self.parent)
    }
}
