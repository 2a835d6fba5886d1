//! Relational store plumbing
//!
//! Connection pooling (PostgreSQL or SQLite) and the migrations for the relational mirror.

pub mod connection;

pub use connection::{initialize_database, ConnectionStats, DatabaseConfig, DatabasePool};
