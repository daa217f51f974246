//! Relational backend for the protoreg schema registry.
//!
//! Module and version metadata is kept in a relational database (PostgreSQL
//! in production, SQLite for tests and single-node installs) while file
//! contents are deduplicated in an object store.
//!
//! # Architecture
//! - [`ConnectionManager`] owns one primary pool and any number of read
//!   replicas. Reads rotate across healthy replicas and fall back to the
//!   primary; writes always use the primary.
//! - [`spawn_health_routine`] periodically probes replicas and evicts the
//!   ones that stop answering.
//! - [`RelationalBackend`] implements every storage capability on top of
//!   both. Creating a version is a single transaction: either every file row
//!   is committed, or none is.

mod backend;
pub mod db;
pub mod error;
pub mod health;
pub mod manager;
mod models;
mod repo;

pub use crate::backend::RelationalBackend;
pub use crate::db::{ConnectionPool, ConnectionSettings, PoolSettings, migrate};
pub use crate::health::spawn_health_routine;
pub use crate::manager::ConnectionManager;
