//! Relay harness.
//!
//! Runs the relay HTTP surface and upstream pollers against Postgres (or in memory), and carries
//! the operator commands for migrations, SubNode registration and manual job injection.

pub mod backend;
pub mod config;
pub mod enqueue;
pub mod migrate;
pub mod pgqueue;
pub mod serve;
pub mod subnode;
