//! Core domain types for the service request core.
//!
//! Pure domain types with no persistence dependencies:
//! - Caller identity
//! - Businesses, reviews and rating arithmetic
//! - Scheduling instants and legacy date/time migration
//! - Service request typestate machine

pub mod actor;
pub mod business;
pub mod request;
pub mod scheduling;

pub use actor::{Actor, Party};
