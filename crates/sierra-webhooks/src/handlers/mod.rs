//! HTTP handlers for the operator API.

pub mod circuit_breakers;
pub mod deliveries;
pub mod health;
pub mod metrics;
