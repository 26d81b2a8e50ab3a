//! # taskq-api
//!
//! The HTTP surface of the task-queue service: axum router and handlers,
//! basic-auth middleware, configuration, and the periodic reaper loop wiring.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod router;
