//! Agent memory.
//!
//! [`Memory`] is the narrow interface agents use to remember and recall
//! text. [`InMemoryMemory`] is the process-local implementation used when no
//! external memory service is configured.

mod error;
mod memory;

pub use error::MemoryError;
pub use memory::{
    ConversationTurn, InMemoryMemory, Memory, MemoryEntry, MemoryType, ParseMemoryTypeError,
};
