//! # Connections
//!
//! Durable store implementations of `BatchStore`.

/// SQLite store built on rusqlite.
pub mod db_sqlite;
