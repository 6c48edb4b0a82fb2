//! Core Module - Scanning, Scoring & Remediation
//!
//! Probe fan-out and streaming, aggregate risk and confidence,
//! admission control, claim-once idempotency and pre-simulation.

pub mod idempotency;
pub mod orchestrator;
pub mod probes;
pub mod rate_limiter;
pub mod remediation;
pub mod risk_score;
pub mod simulator;

pub use idempotency::*;
pub use orchestrator::*;
pub use probes::*;
pub use rate_limiter::*;
pub use remediation::*;
pub use risk_score::*;
pub use simulator::*;
