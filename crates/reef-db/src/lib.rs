//! SQLite plumbing behind the Reef span store.
//!
//! [`open_pool`] hands out `r2d2` connections to a file or a private
//! in-memory database; [`migrate`] brings the span schema up to date from
//! SQL compiled into the crate.

mod migrations;
mod pool;

pub use migrations::{applied_migrations, migrate, MigrationError};
pub use pool::{open_pool, DbLocation, DbPool, PoolError, PoolSettings};
