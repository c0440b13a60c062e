//! The Reef dispatch core.
//!
//! [`Reef`] turns `send`, `broadcast`, `request` and `reply` calls into
//! validated spores, opens a producer span for each, stamps trace context
//! and channel into the spore metadata and hands it to a
//! [`reef_backend::Backend`]. It also keeps the channel registry, correlates
//! responses with pending requests and tracks in-flight work so callers can
//! wait for quiescence before shutting down.

mod channel;
mod config;
mod error;
mod outgoing;
mod reef;

pub use channel::{Channel, ChannelStats, SubscriberInfo};
pub use config::ReefConfig;
pub use error::ReefError;
pub use outgoing::OutgoingSpore;
pub use reef::{Reef, ReefStats, SubscribeOptions, WeakReef};
