//! Credit-metered API gateway for logistics GIS services.
//!
//! Callers authenticate with an API key or a session cookie. Every billable request runs
//! through the gateway pipeline in [`services::gateway`], which rate limits, reserves
//! credits, runs the operation and records exactly one usage entry.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
