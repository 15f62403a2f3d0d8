//! # jobq
//!
//! Durable at-least-once job queue: an append-only job log, consumer groups
//! with exactly one in-flight owner per job, requeue of stuck work, and a
//! time-ordered completion ledger.
//!
//! Backed by Postgres ([`store::PgStore`]) or by process memory
//! ([`store::MemoryStore`]); both implement [`store::Store`] and give the
//! same guarantees. [`queue::Queue`] is the engine API, [`worker::Worker`]
//! and [`sweeper::Sweeper`] are the long-running tasks, and [`http`]
//! exposes the operator surface.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod model;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod worker;
