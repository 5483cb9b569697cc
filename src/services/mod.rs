//! Business logic services.
//!
//! Services contain core business logic separated from HTTP handlers.
//!
//! - `authenticator`, `rate_limiter`, `credit_ledger`, `usage_recorder`: gateway stages
//! - `gateway`: the metering pipeline that wires the stages around an operation
//! - `gis`, `datasets`: operations run behind the gateway
//! - `demo`: self-test operations for the pipeline
//! - `accounts`: registration, login sessions and API key management (unmetered)
//! - `tasks`: supervisor for detached background work

pub mod accounts;
pub mod authenticator;
pub mod credit_ledger;
pub mod datasets;
pub mod demo;
pub mod gateway;
pub mod gis;
pub mod rate_limiter;
pub mod tasks;
pub mod usage_recorder;
