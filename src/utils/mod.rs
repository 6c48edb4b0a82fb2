//! Utils Module - Shared Helpers
//!
//! Evidence cache, constants and telemetry counters used across the crate.

pub mod cache;
pub mod constants;
pub mod decoder;
pub mod telemetry;

pub use cache::*;
pub use constants::*;
pub use decoder::*;
pub use telemetry::*;
