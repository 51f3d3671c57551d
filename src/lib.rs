//! Claude Todo — persistent task queue executed through the Claude CLI.
//!
//! Tasks are pushed into a relational store, claimed one-per-group by
//! workers under optimistic locking, executed by shelling out to the CLI,
//! and retried with backoff when the CLI reports a usage limit.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod queue;
pub mod store;
pub mod task;
pub mod worker;
