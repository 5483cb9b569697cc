//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, query string, headers)
//! 2. Calls a service, or hands an operation to the gateway for metered routes
//! 3. Returns HTTP response (JSON, status code)

/// API key management endpoints
pub mod api_keys;
/// Registration, login and session endpoints
pub mod auth;
/// Balance endpoints
pub mod credits;
/// Metered dataset endpoints
pub mod datasets;
/// Metered self-test endpoints
pub mod demo;
/// Metered GIS endpoint
pub mod gis;
pub mod health;
/// Usage history endpoint
pub mod usage;
