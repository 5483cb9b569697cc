//! HTTP middleware components.
//!
//! Middleware are functions that run before route handlers.
//! Here they authenticate unmetered routes and reject unknown callers before the
//! handler runs. Metered routes authenticate inside the gateway instead.

/// API key and session authentication middleware
pub mod auth;
