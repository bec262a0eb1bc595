//! Service request aggregate: domain model, status table and state transitions.
//!
//! - Request types and states (typestate pattern)
//! - The canonical status vocabulary and transition table
//! - The persisted record shape and its validating decode
//! - State transition methods

pub mod record;
pub mod state;
pub mod status;
pub mod transitions;

pub use record::ServiceRequestRecord;
pub use state::*;
pub use status::{Action, ActionKind, RequestStatus, available_actions};
