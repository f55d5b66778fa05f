//! Lite-mode implementations of `relay-core` interfaces.
//!
//! Postgres-backed queue and store for deployments, plus in-memory equivalents for local runs and
//! tests.

pub mod memory;
pub mod pgqueue;
pub mod pgstore;
