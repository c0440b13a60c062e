//! Process-wide lookup of agents by name.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::agent::Agent;

/// Registered agents, keyed by name.
///
/// Created explicitly and shared through `Arc`; there is no global instance.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `agent`, returning the agent it replaced.
    pub fn register(&self, agent: Arc<Agent>) -> Option<Arc<Agent>> {
        let name = agent.name().to_string();
        let previous = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), agent);
        if previous.is_some() {
            tracing::debug!(agent = %name, "agent replaced in registry");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All agents, ordered by name.
    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Handler;

    fn agent(name: &str) -> Arc<Agent> {
        Arc::new(
            Agent::builder(name)
                .handler(Handler::sync(|_, _| Ok(None)))
                .build()
                .expect("should build agent"),
        )
    }

    #[test]
    fn register_replaces_by_name() {
        let registry = AgentRegistry::new();
        assert!(registry.register(agent("writer")).is_none());
        assert!(registry.register(agent("analyst")).is_none());
        assert!(registry.register(agent("writer")).is_some());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["analyst", "writer"]);
        assert_eq!(
            registry.list().iter().map(|a| a.name()).collect::<Vec<_>>(),
            vec!["analyst", "writer"]
        );
    }

    #[test]
    fn get_remove_and_clear() {
        let registry = AgentRegistry::new();
        registry.register(agent("writer"));

        assert!(registry.get("writer").is_some());
        assert!(registry.get("ghost").is_none());
        assert!(registry.remove("writer").is_some());
        assert!(registry.remove("writer").is_none());

        registry.register(agent("writer"));
        registry.clear();
        assert!(registry.is_empty());
    }
}
