//! carbon_usage: per-user carbon usage tracking over HTTP
//!
//! A shared catalog of usage types (activity + unit of measure) and
//! timestamped usages owned by the user who recorded them, persisted in Sled
//! and served as a token-authenticated JSON API by Axum.

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod payload;
// Ordering, time-range filter and pagination for list endpoints
pub mod query;
pub mod rest;
pub mod storage;
pub mod telemetry;
