//! Topic routing rules shared by the AMQP backend and its tests.
//!
//! | Spore | Routing key |
//! |-------|-------------|
//! | `to_agent` set | `agent.<to_agent>.<spore_type>` |
//! | broadcast | `broadcast.<spore_type>` |
//! | otherwise | `<channel>.<spore_type>` |
//!
//! A subscription on `agent.<name>` binds `agent.<name>.*` and `broadcast.*`;
//! a subscription on any other channel `X` binds `X.*`.

use reef_types::{Spore, SporeType};

/// Prefix of per-agent channels.
pub const AGENT_CHANNEL_PREFIX: &str = "agent.";
/// First word of broadcast routing keys.
pub const BROADCAST_TOPIC: &str = "broadcast";

/// The per-agent channel name, `agent.<name>`.
pub fn agent_channel(agent: &str) -> String {
    format!("{AGENT_CHANNEL_PREFIX}{agent}")
}

/// True for `agent.<name>` channels.
pub fn is_agent_channel(channel: &str) -> bool {
    channel.starts_with(AGENT_CHANNEL_PREFIX)
}

/// The routing key a spore is published with.
pub fn routing_key(spore: &Spore, channel: &str) -> String {
    let ty = spore.spore_type.as_str();
    match &spore.to_agent {
        Some(to) => format!("{AGENT_CHANNEL_PREFIX}{to}.{ty}"),
        None if spore.spore_type == SporeType::Broadcast => format!("{BROADCAST_TOPIC}.{ty}"),
        None => format!("{channel}.{ty}"),
    }
}

/// Binding patterns for a queue serving `channel`.
pub fn binding_patterns(channel: &str) -> Vec<String> {
    if is_agent_channel(channel) {
        vec![format!("{channel}.*"), format!("{BROADCAST_TOPIC}.*")]
    } else {
        vec![format!("{channel}.*")]
    }
}

/// The durable queue serving `agent` on `channel`.
///
/// An agent's own channel gets `<prefix>.agent.<name>`; any other channel
/// gets one queue per subscribing agent, `<prefix>.<channel>.<agent>`.
pub fn queue_name(prefix: &str, channel: &str, agent: &str) -> String {
    if channel == agent_channel(agent) {
        format!("{prefix}.{channel}")
    } else {
        format!("{prefix}.{channel}.{agent}")
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            words_match(rest, key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => words_match(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) if word == key_word => {
            words_match(rest, key_rest)
        }
        _ => false,
    }
}

/// Picks the subscription channel a delivery belongs to.
///
/// On an agent's own queue, broadcasts and direct spores go to the agent's
/// subscription on the channel recorded in the spore's `channel` metadata.
/// On any other queue `X`, only spores routed with an `X.` key are accepted.
/// `None` means the delivery matches no subscription of this queue.
pub fn delivery_channel(
    queue_channel: &str,
    agent: &str,
    spore: &Spore,
    routing_key: &str,
) -> Option<String> {
    let own_queue = queue_channel == agent_channel(agent);
    let routed_here = topic_matches(&format!("{queue_channel}.*"), routing_key);

    if own_queue {
        let broadcast = topic_matches(&format!("{BROADCAST_TOPIC}.*"), routing_key);
        if broadcast || routed_here {
            return Some(spore.channel().unwrap_or(queue_channel).to_string());
        }
        return None;
    }

    routed_here.then(|| queue_channel.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_types::{metadata_keys, Knowledge};

    #[test]
    fn routing_keys() {
        let direct = Spore::direct("a", "bob", Knowledge::new());
        assert_eq!(routing_key(&direct, "agent.bob"), "agent.bob.knowledge");

        let broadcast = Spore::broadcast("a", Knowledge::new());
        assert_eq!(routing_key(&broadcast, "main"), "broadcast.broadcast");

        let notice = Spore::new(SporeType::Notification, "a", None, Knowledge::new());
        assert_eq!(routing_key(&notice, "alerts"), "alerts.notification");
    }

    #[test]
    fn bindings() {
        assert_eq!(
            binding_patterns("agent.bob"),
            vec!["agent.bob.*".to_string(), "broadcast.*".to_string()]
        );
        assert_eq!(binding_patterns("alerts"), vec!["alerts.*".to_string()]);
    }

    #[test]
    fn queue_names() {
        assert_eq!(queue_name("reef", "agent.bob", "bob"), "reef.agent.bob");
        assert_eq!(queue_name("reef", "main", "bob"), "reef.main.bob");
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("agent.bob.*", "agent.bob.request"));
        assert!(!topic_matches("agent.bob.*", "agent.bobby.request"));
        assert!(!topic_matches("agent.bob.*", "agent.bob.x.y"));
        assert!(topic_matches("broadcast.#", "broadcast"));
        assert!(topic_matches("broadcast.#", "broadcast.a.b"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("main.*", "broadcast.broadcast"));
    }

    #[test]
    fn own_queue_routes_broadcast_to_its_channel() {
        let spore = Spore::broadcast("a", Knowledge::new())
            .with_metadata(metadata_keys::CHANNEL, "main");
        assert_eq!(
            delivery_channel("agent.bob", "bob", &spore, "broadcast.broadcast").as_deref(),
            Some("main")
        );
    }

    #[test]
    fn own_queue_routes_direct_to_agent_channel() {
        let spore = Spore::direct("a", "bob", Knowledge::new())
            .with_metadata(metadata_keys::CHANNEL, "agent.bob");
        assert_eq!(
            delivery_channel("agent.bob", "bob", &spore, "agent.bob.knowledge").as_deref(),
            Some("agent.bob")
        );
    }

    #[test]
    fn channel_queue_only_takes_its_own_keys() {
        let spore = Spore::new(SporeType::Notification, "a", None, Knowledge::new())
            .with_metadata(metadata_keys::CHANNEL, "alerts");
        assert_eq!(
            delivery_channel("alerts", "bob", &spore, "alerts.notification").as_deref(),
            Some("alerts")
        );
        assert_eq!(
            delivery_channel("alerts", "bob", &spore, "broadcast.broadcast"),
            None
        );
    }
}
