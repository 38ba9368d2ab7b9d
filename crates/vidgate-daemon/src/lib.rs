//! vidgate-daemon: the HTTP surface of the file-storage gateway.
//!
//! Wires the streaming core (`vidgate-stream`) and the quota catalog
//! (`vidgate-store`) behind an axum router, with bearer authentication
//! delegated to an external identity service and optional usage metering.

pub mod auth;
pub mod middleware;
pub mod server;
pub mod stream;
pub mod telemetry;
pub mod usage;
