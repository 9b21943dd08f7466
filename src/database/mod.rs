//! Database layer: connection pooling and code-based migrations

pub mod migrations;
pub mod pool;

pub use pool::Database;
