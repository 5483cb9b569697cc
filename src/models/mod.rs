//! Data models representing database entities and API payloads.
//!
//! This module contains all data structures that map to database tables,
//! plus the request/response bodies of the HTTP endpoints built on them.

/// API key model and management payloads
pub mod api_key;
/// Credit balance payloads
pub mod credits;
/// Usage log entries and aggregates
pub mod usage;
/// Users and login sessions
pub mod user;
