//! HTTP API server for ferry.
//!
//! This crate provides the transport in front of the transfer engine:
//! - Upload open, chunk, status, seal and cancel endpoints
//! - Share-code downloads with byte ranges
//! - Health and Prometheus metrics endpoints
//! - The periodic garbage collection scheduler

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod trace;

pub use error::ApiError;
pub use routes::create_router;
pub use scheduler::spawn_gc_scheduler;
pub use state::AppState;
pub use trace::TraceId;
