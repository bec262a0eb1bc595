//! Canonical request status vocabulary and the lifecycle transition table.
//!
//! Every status change in the crate is checked against
//! [`RequestStatus::can_transition_to`]; nothing else encodes the edges.
//!
//! ```text
//! Pending ──cancel (C)──────────> Cancelled
//!    │ ──decline (B)────────────> Declined
//!    └──accept (B)──> Accepted ──mark complete (B)──> Completed ──review (C)──> Reviewed
//!                         │
//!                         └──request payment (B)──> Pending Payment
//!                                                       │
//!                    Confirming Payment <──pay (C)──────┘
//!                         │
//!                         └──confirm (B)──> Reservice Accomplished ──review (C)──> Reviewed
//! ```

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::PaymentMethod;
use crate::domain::actor::Party;
use crate::error::HandymanError;

/// Status of a service request as stored in the `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    PendingPayment,
    ConfirmingPayment,
    Paid,
    Completed,
    ReserviceAccomplished,
    Reviewed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 10] = [
        RequestStatus::Pending,
        RequestStatus::Accepted,
        RequestStatus::Declined,
        RequestStatus::Cancelled,
        RequestStatus::PendingPayment,
        RequestStatus::ConfirmingPayment,
        RequestStatus::Paid,
        RequestStatus::Completed,
        RequestStatus::ReserviceAccomplished,
        RequestStatus::Reviewed,
    ];

    /// The canonical string written to the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Accepted => "Accepted",
            RequestStatus::Declined => "Declined",
            RequestStatus::Cancelled => "Cancelled",
            RequestStatus::PendingPayment => "Pending Payment",
            RequestStatus::ConfirmingPayment => "Confirming Payment",
            RequestStatus::Paid => "Paid",
            RequestStatus::Completed => "Completed",
            RequestStatus::ReserviceAccomplished => "Reservice Accomplished",
            RequestStatus::Reviewed => "Reviewed",
        }
    }

    /// Parse a status string read from the store, normalizing legacy spellings.
    ///
    /// Older documents carry variants such as `"Reservice Accomplished!"`, lower-case
    /// values, or stray whitespace. Anything that does not map onto the canonical set
    /// is rejected rather than defaulted.
    pub fn from_stored(raw: &str) -> Result<Self, HandymanError> {
        let normalized = raw.trim().trim_end_matches('!').trim();
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| HandymanError::Validation(format!("unknown request status '{}'", raw)))
    }

    /// Whether `self -> to` is an edge of the lifecycle.
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Pending, Cancelled)
                | (Pending, Declined)
                | (Pending, Accepted)
                | (Accepted, PendingPayment)
                | (Accepted, Completed)
                | (PendingPayment, ConfirmingPayment)
                | (ConfirmingPayment, ReserviceAccomplished)
                | (ReserviceAccomplished, Reviewed)
                | (Completed, Reviewed)
        )
    }

    /// A status with no outgoing edges.
    pub fn is_terminal(self) -> bool {
        RequestStatus::ALL
            .into_iter()
            .all(|to| !self.can_transition_to(to))
    }

    /// Fraction of the happy path covered, for progress indicators.
    pub fn progress(self) -> f32 {
        match self {
            RequestStatus::Pending => 0.2,
            RequestStatus::Accepted => 0.4,
            RequestStatus::PendingPayment => 0.6,
            RequestStatus::ConfirmingPayment => 0.8,
            RequestStatus::ReserviceAccomplished
            | RequestStatus::Completed
            | RequestStatus::Paid
            | RequestStatus::Reviewed => 1.0,
            RequestStatus::Declined | RequestStatus::Cancelled => 0.0,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = HandymanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::from_stored(s)
    }
}

impl TryFrom<String> for RequestStatus {
    type Error = HandymanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RequestStatus::from_stored(&value)
    }
}

impl From<RequestStatus> for &'static str {
    fn from(status: RequestStatus) -> Self {
        status.as_str()
    }
}

/// Kinds of lifecycle actions, without their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Cancel,
    Decline,
    Accept,
    RequestPayment,
    MarkComplete,
    SubmitPayment,
    ConfirmPayment,
    SubmitReview,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Cancel,
        ActionKind::Decline,
        ActionKind::Accept,
        ActionKind::RequestPayment,
        ActionKind::MarkComplete,
        ActionKind::SubmitPayment,
        ActionKind::ConfirmPayment,
        ActionKind::SubmitReview,
    ];

    /// Status the request ends up in after this action.
    pub fn target(self) -> RequestStatus {
        match self {
            ActionKind::Cancel => RequestStatus::Cancelled,
            ActionKind::Decline => RequestStatus::Declined,
            ActionKind::Accept => RequestStatus::Accepted,
            ActionKind::RequestPayment => RequestStatus::PendingPayment,
            ActionKind::MarkComplete => RequestStatus::Completed,
            ActionKind::SubmitPayment => RequestStatus::ConfirmingPayment,
            ActionKind::ConfirmPayment => RequestStatus::ReserviceAccomplished,
            ActionKind::SubmitReview => RequestStatus::Reviewed,
        }
    }

    /// Which side of the request may perform this action.
    pub fn party(self) -> Party {
        match self {
            ActionKind::Cancel | ActionKind::SubmitPayment | ActionKind::SubmitReview => {
                Party::Consumer
            }
            ActionKind::Decline
            | ActionKind::Accept
            | ActionKind::RequestPayment
            | ActionKind::MarkComplete
            | ActionKind::ConfirmPayment => Party::Business,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Cancel => "cancel",
            ActionKind::Decline => "decline",
            ActionKind::Accept => "accept",
            ActionKind::RequestPayment => "request_payment",
            ActionKind::MarkComplete => "mark_complete",
            ActionKind::SubmitPayment => "submit_payment",
            ActionKind::ConfirmPayment => "confirm_payment",
            ActionKind::SubmitReview => "submit_review",
        }
    }

    /// Message reported to the initiating party once the action committed.
    pub fn success_message(self) -> &'static str {
        match self {
            ActionKind::Cancel => "Request cancelled.",
            ActionKind::Decline => "Request declined.",
            ActionKind::Accept => "Request accepted.",
            ActionKind::RequestPayment => "Payment requested.",
            ActionKind::MarkComplete => "Request marked as completed.",
            ActionKind::SubmitPayment => "Payment submitted.",
            ActionKind::ConfirmPayment => "Payment confirmed.",
            ActionKind::SubmitReview => "Review submitted. Thank you!",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-changing action applied through the lifecycle, with its side fields.
///
/// Reviews are not listed here: they span the business record and go through
/// [`crate::rating::RatingAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Cancel,
    Decline,
    Accept { amount: Option<Decimal> },
    RequestPayment { amount: Option<Decimal> },
    MarkComplete,
    SubmitPayment { method: PaymentMethod },
    ConfirmPayment,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Cancel => ActionKind::Cancel,
            Action::Decline => ActionKind::Decline,
            Action::Accept { .. } => ActionKind::Accept,
            Action::RequestPayment { .. } => ActionKind::RequestPayment,
            Action::MarkComplete => ActionKind::MarkComplete,
            Action::SubmitPayment { .. } => ActionKind::SubmitPayment,
            Action::ConfirmPayment => ActionKind::ConfirmPayment,
        }
    }

    pub fn target(&self) -> RequestStatus {
        self.kind().target()
    }

    pub fn party(&self) -> Party {
        self.kind().party()
    }
}

/// Actions `party` may take on a request currently in `status`.
pub fn available_actions(status: RequestStatus, party: Party) -> Vec<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .filter(|kind| kind.party() == party && status.can_transition_to(kind.target()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_has_exactly_nine_edges() {
        let edges = RequestStatus::ALL
            .into_iter()
            .flat_map(|from| RequestStatus::ALL.into_iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(edges, 9);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(RequestStatus::Declined.is_terminal());
        assert!(RequestStatus::Reviewed.is_terminal());
        assert!(RequestStatus::Paid.is_terminal());
        assert!(!RequestStatus::Completed.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
    }

    #[test]
    fn test_every_action_targets_a_reachable_status() {
        for kind in ActionKind::ALL {
            let sources: Vec<_> = RequestStatus::ALL
                .into_iter()
                .filter(|from| from.can_transition_to(kind.target()))
                .collect();
            assert!(!sources.is_empty(), "{} has no source status", kind);
        }
    }

    #[test]
    fn test_legacy_status_spellings_normalize() {
        assert_eq!(
            RequestStatus::from_stored("Reservice Accomplished!").unwrap(),
            RequestStatus::ReserviceAccomplished
        );
        assert_eq!(
            RequestStatus::from_stored("  pending payment ").unwrap(),
            RequestStatus::PendingPayment
        );
        assert!(matches!(
            RequestStatus::from_stored("Done"),
            Err(HandymanError::Validation(_))
        ));
    }

    #[test]
    fn test_status_serde_uses_canonical_strings() {
        let json = serde_json::to_string(&RequestStatus::ConfirmingPayment).unwrap();
        assert_eq!(json, r#""Confirming Payment""#);
        let parsed: RequestStatus = serde_json::from_str(r#""Reservice Accomplished!""#).unwrap();
        assert_eq!(parsed, RequestStatus::ReserviceAccomplished);
    }

    #[test]
    fn test_available_actions_per_party() {
        assert_eq!(
            available_actions(RequestStatus::Pending, Party::Consumer),
            vec![ActionKind::Cancel]
        );
        assert_eq!(
            available_actions(RequestStatus::Pending, Party::Business),
            vec![ActionKind::Decline, ActionKind::Accept]
        );
        assert_eq!(
            available_actions(RequestStatus::Completed, Party::Consumer),
            vec![ActionKind::SubmitReview]
        );
        assert!(available_actions(RequestStatus::Reviewed, Party::Consumer).is_empty());
        assert!(available_actions(RequestStatus::Reviewed, Party::Business).is_empty());
    }

    #[test]
    fn test_progress_is_monotonic_on_payment_path() {
        let path = [
            RequestStatus::Pending,
            RequestStatus::Accepted,
            RequestStatus::PendingPayment,
            RequestStatus::ConfirmingPayment,
            RequestStatus::ReserviceAccomplished,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }
}
