//! Persistence layer - Settings and instance history in SQLite

mod database;

pub use database::{events, Database, HistoryEvent};
