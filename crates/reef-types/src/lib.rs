//! Shared message types for the Reef agent runtime.
//!
//! This crate defines the [`Spore`] envelope exchanged between agents and the
//! codec that turns it into a broker frame and back.

pub mod error;
pub mod spore;
pub mod wire;

pub use error::{SporeError, WireError};
pub use spore::{
    clamp_priority, knowledge, metadata_keys, Knowledge, ParseSporeTypeError, Spore, SporeType,
    KNOWLEDGE_TYPE_KEY, PRIORITY_HIGH, PRIORITY_MAX, PRIORITY_MIN, PRIORITY_NORMAL,
};
pub use wire::BrokerMessage;
