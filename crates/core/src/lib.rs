//! Domain layer for the delivery webhook: canonical event representation,
//! payload-shape normalization, and the event-kind classification table.
//!
//! This crate is free of I/O so every rule here can be exercised with plain
//! unit tests.

pub mod classifier;
pub mod normalizer;
pub mod types;
