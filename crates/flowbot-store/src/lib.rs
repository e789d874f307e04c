//! SQLite persistence for the conversation engine.
//!
//! One [`SqliteStore`] implements every storage-facing collaborator trait:
//! the session lock, the execution record store, the conversation history,
//! and the field-capture table. Flow-tracking columns and history rows live
//! in separate tables so the two kinds of writes never clobber each other.

mod captures;
mod executions;
mod history;
mod lock;
mod schema;
mod store;

pub use store::SqliteStore;
