//! Testing utilities and mock implementations
//!
//! Lets the pipeline run end to end without a model provider, a broker or
//! durable storage.

pub mod mocks;

pub use mocks::*;
