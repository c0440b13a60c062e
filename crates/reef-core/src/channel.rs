//! Named fan-out points and their bookkeeping.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use reef_types::Spore;
use serde::Serialize;

/// One agent listening on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberInfo {
    pub agent: String,
    pub responds_to: Option<BTreeSet<String>>,
}

/// Counter snapshot for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub spores_published: u64,
    pub spores_delivered: u64,
    pub subscriber_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A channel in the reef's registry.
///
/// Holds the subscriber list as the reef sees it, a bounded buffer of the
/// most recently published spores and delivery counters. Delivery itself is
/// the backend's job.
#[derive(Debug)]
pub struct Channel {
    name: String,
    created_at: DateTime<Utc>,
    capacity: usize,
    subscribers: RwLock<Vec<SubscriberInfo>>,
    recent: Mutex<VecDeque<Spore>>,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            capacity,
            subscribers: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current subscribers, in subscription order.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Up to `limit` most recently published spores, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Spore> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            name: self.name.clone(),
            spores_published: self.published.load(Ordering::Relaxed),
            spores_delivered: self.delivered.load(Ordering::Relaxed),
            subscriber_count: self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn add_subscriber(&self, info: SubscriberInfo, replace: bool) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if replace {
            subscribers.retain(|s| s.agent != info.agent);
        }
        subscribers.push(info);
    }

    pub(crate) fn remove_subscriber(&self, agent: &str) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.agent != agent);
        subscribers.len() < before
    }

    pub(crate) fn record_published(&self, spore: &Spore) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        while recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(spore.clone());
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_types::Knowledge;

    fn subscriber(agent: &str) -> SubscriberInfo {
        SubscriberInfo {
            agent: agent.to_string(),
            responds_to: None,
        }
    }

    #[test]
    fn buffer_keeps_most_recent() {
        let channel = Channel::new("main", 2);
        let spores: Vec<Spore> = (0..3)
            .map(|_| Spore::broadcast("a", Knowledge::new()))
            .collect();
        for spore in &spores {
            channel.record_published(spore);
        }

        let recent = channel.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id(), spores[1].id());
        assert_eq!(recent[1].id(), spores[2].id());
        assert_eq!(channel.recent(1)[0].id(), spores[2].id());
        assert_eq!(channel.stats().spores_published, 3);
    }

    #[test]
    fn zero_capacity_buffers_nothing() {
        let channel = Channel::new("main", 0);
        channel.record_published(&Spore::broadcast("a", Knowledge::new()));
        assert!(channel.recent(5).is_empty());
        assert_eq!(channel.stats().spores_published, 1);
    }

    #[test]
    fn replace_evicts_same_agent() {
        let channel = Channel::new("main", 10);
        channel.add_subscriber(subscriber("a"), true);
        channel.add_subscriber(subscriber("a"), true);
        channel.add_subscriber(subscriber("b"), true);
        assert_eq!(channel.stats().subscriber_count, 2);

        channel.add_subscriber(subscriber("a"), false);
        assert_eq!(channel.subscribers().len(), 3);

        assert!(channel.remove_subscriber("a"));
        assert!(!channel.remove_subscriber("a"));
        assert_eq!(channel.subscribers(), vec![subscriber("b")]);
    }
}
