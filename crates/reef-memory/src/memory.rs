//! The memory interface and its in-process implementation.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

const DEFAULT_MAX_TURNS: usize = 50;

/// How long-lived a memory is meant to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    #[default]
    ShortTerm,
    LongTerm,
    Episodic,
    Semantic,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = ParseMemoryTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            _ => Err(ParseMemoryTypeError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown memory type label.
#[derive(Debug, Clone)]
pub struct ParseMemoryTypeError(pub String);

impl std::fmt::Display for ParseMemoryTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown memory type: {}", self.0)
    }
}

impl std::error::Error for ParseMemoryTypeError {}

/// One remembered item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    /// Relevance weight in `[0, 1]`.
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

/// One line of a conversation kept for context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// What agents can remember and recall.
///
/// Implementations may block; async callers should run them on the blocking
/// pool when the backing store is remote.
pub trait Memory: Send + Sync {
    /// Stores `content` and returns its id.
    ///
    /// # Errors
    ///
    /// `InvalidImportance` outside `[0, 1]`, `EmptyContent` for blank text.
    fn remember(
        &self,
        content: &str,
        importance: f64,
        memory_type: MemoryType,
    ) -> Result<String, MemoryError>;

    /// Up to `limit` entries most relevant to `query`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// # Errors
    ///
    /// Backend failures.
    fn recall_by_id(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError>;

    /// The last `turns` conversation turns, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn conversation_context(&self, turns: usize) -> Result<Vec<ConversationTurn>, MemoryError>;

    /// # Errors
    ///
    /// Backend failures.
    fn add_conversation_turn(&self, role: &str, content: &str) -> Result<(), MemoryError>;

    /// Forgets everything.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn clear(&self) -> Result<(), MemoryError>;
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<MemoryEntry>,
    conversation: VecDeque<ConversationTurn>,
}

/// Keeps memories in process.
///
/// Recall ranks by the number of query terms an entry shares, then by
/// importance, then by recency. Entries sharing no term are not returned
/// unless the query itself has no terms.
#[derive(Debug)]
pub struct InMemoryMemory {
    state: RwLock<State>,
    max_turns: usize,
}

impl Default for InMemoryMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::with_max_turns(DEFAULT_MAX_TURNS)
    }

    /// Keeps at most `max_turns` conversation turns.
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            max_turns,
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl Memory for InMemoryMemory {
    fn remember(
        &self,
        content: &str,
        importance: f64,
        memory_type: MemoryType,
    ) -> Result<String, MemoryError> {
        if !(0.0..=1.0).contains(&importance) {
            return Err(MemoryError::InvalidImportance(importance));
        }
        if content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            memory_type,
            importance,
            created_at: Utc::now(),
        };
        let id = entry.id.clone();
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .push(entry);
        tracing::trace!(memory_id = %id, memory_type = %memory_type, "remembered");
        Ok(id)
    }

    fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let wanted = terms(query);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        // Insertion index breaks timestamp ties in favour of the newer entry.
        let mut scored: Vec<(usize, usize, &MemoryEntry)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let overlap = terms(&entry.content).intersection(&wanted).count();
                (overlap, index, entry)
            })
            .filter(|(overlap, _, _)| wanted.is_empty() || *overlap > 0)
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.2.importance.total_cmp(&a.2.importance))
                .then_with(|| b.2.created_at.cmp(&a.2.created_at))
                .then_with(|| b.1.cmp(&a.1))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, entry)| entry.clone())
            .collect())
    }

    fn recall_by_id(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    fn conversation_context(&self, turns: usize) -> Result<Vec<ConversationTurn>, MemoryError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let skip = state.conversation.len().saturating_sub(turns);
        Ok(state.conversation.iter().skip(skip).cloned().collect())
    }

    fn add_conversation_turn(&self, role: &str, content: &str) -> Result<(), MemoryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.conversation.push_back(ConversationTurn {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        });
        while state.conversation.len() > self.max_turns {
            state.conversation.pop_front();
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), MemoryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries.clear();
        state.conversation.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recall_ranks_by_overlap_then_importance() {
        let memory = InMemoryMemory::new();
        let low = memory
            .remember("coral reefs bleach in warm water", 0.2, MemoryType::Semantic)
            .expect("should remember");
        let high = memory
            .remember("coral spawning follows the moon", 0.9, MemoryType::Semantic)
            .expect("should remember");
        let both = memory
            .remember("warm water stresses coral", 0.1, MemoryType::Episodic)
            .expect("should remember");
        memory
            .remember("kelp forests grow fast", 1.0, MemoryType::Semantic)
            .expect("should remember");

        let hits = memory.recall("warm coral", 10).expect("should recall");
        let ids: Vec<&str> = hits.iter().map(|e| e.id.as_str()).collect();
        // `both` and `low` share two terms; `high` shares one.
        assert_eq!(ids, vec![low.as_str(), both.as_str(), high.as_str()]);

        let top = memory.recall("warm coral", 1).expect("should recall");
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn recency_breaks_ties() {
        let memory = InMemoryMemory::new();
        let older = memory
            .remember("tide table", 0.5, MemoryType::ShortTerm)
            .expect("should remember");
        let newer = memory
            .remember("tide chart", 0.5, MemoryType::ShortTerm)
            .expect("should remember");

        let hits = memory.recall("tide", 2).expect("should recall");
        assert_eq!(hits[0].id, newer);
        assert_eq!(hits[1].id, older);
    }

    #[test]
    fn empty_query_returns_everything_ranked() {
        let memory = InMemoryMemory::new();
        memory
            .remember("a", 0.1, MemoryType::ShortTerm)
            .expect("should remember");
        let important = memory
            .remember("b", 0.8, MemoryType::LongTerm)
            .expect("should remember");

        let hits = memory.recall("", 5).expect("should recall");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, important);
    }

    #[test]
    fn invalid_input_is_rejected() {
        let memory = InMemoryMemory::new();
        assert!(matches!(
            memory.remember("x", 1.5, MemoryType::ShortTerm),
            Err(MemoryError::InvalidImportance(_))
        ));
        assert!(matches!(
            memory.remember("   ", 0.5, MemoryType::ShortTerm),
            Err(MemoryError::EmptyContent)
        ));
        assert!(memory.is_empty());
    }

    #[test]
    fn recall_by_id_and_clear() {
        let memory = InMemoryMemory::new();
        let id = memory
            .remember("anchor", 0.5, MemoryType::Episodic)
            .expect("should remember");
        let entry = memory
            .recall_by_id(&id)
            .expect("should look up")
            .expect("entry should exist");
        assert_eq!(entry.content, "anchor");
        assert_eq!(entry.memory_type, MemoryType::Episodic);

        memory.clear().expect("should clear");
        assert!(memory.recall_by_id(&id).expect("should look up").is_none());
    }

    #[test]
    fn conversation_is_bounded() {
        let memory = InMemoryMemory::with_max_turns(2);
        for (role, content) in [("user", "one"), ("assistant", "two"), ("user", "three")] {
            memory
                .add_conversation_turn(role, content)
                .expect("should add turn");
        }

        let all = memory.conversation_context(10).expect("should read context");
        let contents: Vec<&str> = all.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);

        let last = memory.conversation_context(1).expect("should read context");
        assert_eq!(last[0].content, "three");
        assert_eq!(last[0].role, "user");
    }

    #[test]
    fn memory_type_labels() {
        for ty in [
            MemoryType::ShortTerm,
            MemoryType::LongTerm,
            MemoryType::Episodic,
            MemoryType::Semantic,
        ] {
            assert_eq!(ty.as_str().parse::<MemoryType>().expect("should parse"), ty);
        }
        assert!("forever".parse::<MemoryType>().is_err());
    }
}
