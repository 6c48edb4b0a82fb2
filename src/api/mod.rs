//! Wallet Guardian HTTP API
//! Streams scans as SSE and serves the remediation pre-simulation endpoint

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod types;

pub use handlers::AppState;
pub use middleware::{start_maintenance_task, RequestId};
pub use routes::create_router;
pub use types::*;
