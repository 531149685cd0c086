//! Sierra Core Library
//!
//! Shared identifiers and traits used across Sierra crates.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (OrganizationId, DestinationId, AttemptId, EventId)
//! - [`traits`] - Organization scoping (OrganizationScoped)

pub mod ids;
pub mod traits;

pub use ids::{AttemptId, DestinationId, EventId, OrganizationId, ParseIdError};
pub use traits::OrganizationScoped;
