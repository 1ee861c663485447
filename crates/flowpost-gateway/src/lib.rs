//! # Flowpost Gateway
//! HTTP API for the flow engine (axum).
//!
//! `/health` is public. Everything under `/api/v1` needs the cron secret
//! or an owner token; owner tokens are confined to their owner's flows,
//! recipients and runs.

pub mod auth;
pub mod routes;
pub mod server;

pub use auth::Caller;
pub use server::{AppState, build_router, build_router_from_arc, start};
