//! Database layer for ctxreport
//!
//! SQLite persistence for buffered context samples:
//! - Schema migrations
//! - Namespaced sample rows, one namespace per context source

pub mod repo;
pub mod schema;

pub use repo::Database;
