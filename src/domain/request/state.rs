//! Core service request types.
//!
//! Requests use the typestate pattern: `ServiceRequest<S>` can only offer the
//! transitions that are legal from `S`. [`AnyServiceRequest`] holds a request in
//! any state for storage and queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::RequestStatus;
use crate::domain::business::BusinessId;
use crate::error::{HandymanError, Result};

/// Unique identifier for a service request, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Account uid of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(uid: impl Into<String>) -> Self {
        UserId(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum ServiceKind {
    /// One of the business's advertised categories ("Home Repair", "Maid", ...).
    Category(String),
    /// Free-text description for a custom request.
    Custom(String),
}

impl ServiceKind {
    pub fn name(&self) -> &str {
        match self {
            ServiceKind::Category(name) | ServiceKind::Custom(name) => name,
        }
    }
}

/// Payment method chosen by the consumer. No money moves through this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Wallet,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Wallet => "wallet",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = HandymanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "bank_transfer" => Ok(PaymentMethod::BankTransfer),
            "wallet" => Ok(PaymentMethod::Wallet),
            other => Err(HandymanError::Validation(format!(
                "unknown payment method '{}'",
                other
            ))),
        }
    }
}

/// Amounts are whole cents.
const AMOUNT_MAX_SCALE: u32 = 2;

/// Amounts must be strictly positive with at most two decimal places, so every
/// backend stores exactly the value it was given.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(HandymanError::Validation(format!(
            "amount must be greater than zero, got {}",
            amount
        )));
    }
    if amount.normalize().scale() > AMOUNT_MAX_SCALE {
        return Err(HandymanError::Validation(format!(
            "amount must not have more than {} decimal places, got {}",
            AMOUNT_MAX_SCALE, amount
        )));
    }
    Ok(amount)
}

/// Marker trait for valid request states.
pub trait RequestState: Send + Sync {
    const STATUS: RequestStatus;
}

/// A service request in state `T`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRequest<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// Fields that do not depend on the state.
    pub data: RequestData,
}

impl<T: RequestState> ServiceRequest<T> {
    pub fn status(&self) -> RequestStatus {
        T::STATUS
    }
}

/// State-independent request fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestData {
    pub id: RequestId,

    /// The consumer who made the request (immutable).
    pub user_id: UserId,
    /// Denormalized consumer name for display.
    pub user_name: String,

    /// The business the request was sent to (immutable).
    pub business_id: BusinessId,
    /// Denormalized business name for display.
    pub business_name: String,

    pub service: ServiceKind,

    /// When the service is scheduled to take place.
    pub scheduled_at: DateTime<Utc>,

    /// Creation instant, assigned by the store.
    pub created_at: DateTime<Utc>,

    /// Instant of the last status write.
    pub updated_at: DateTime<Utc>,

    /// Client-generated key that deduplicates retried creations.
    pub idempotency_key: Option<String>,
}

/// Consumer-supplied fields for a new request. Status and timestamps are never
/// client-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequestDraft {
    pub user_id: UserId,
    pub user_name: String,
    pub business_id: BusinessId,
    pub business_name: String,
    pub service: ServiceKind,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ServiceRequestDraft {
    /// Check required fields before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.0.trim().is_empty() {
            return Err(HandymanError::Validation("userId is required".to_string()));
        }
        if self.business_id.0.trim().is_empty() {
            return Err(HandymanError::Validation(
                "businessId is required".to_string(),
            ));
        }
        if self.service.name().trim().is_empty() {
            return Err(HandymanError::Validation(
                "a service category or description is required".to_string(),
            ));
        }
        if let Some(key) = &self.idempotency_key
            && key.trim().is_empty()
        {
            return Err(HandymanError::Validation(
                "idempotency key must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Request States
// ============================================================================

/// Waiting for the business to respond. Initial state of every request.
#[derive(Debug, Clone, Serialize)]
pub struct Pending;

impl RequestState for Pending {
    const STATUS: RequestStatus = RequestStatus::Pending;
}

/// The business agreed to do the job, optionally quoting an amount.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub amount: Option<Decimal>,
}

impl RequestState for Accepted {
    const STATUS: RequestStatus = RequestStatus::Accepted;
}

/// Turned down by the business (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Declined;

impl RequestState for Declined {
    const STATUS: RequestStatus = RequestStatus::Declined;
}

/// Withdrawn by the consumer (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Cancelled;

impl RequestState for Cancelled {
    const STATUS: RequestStatus = RequestStatus::Cancelled;
}

/// Work done, waiting for the consumer to pay `amount`.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPayment {
    pub amount: Decimal,
}

impl RequestState for PendingPayment {
    const STATUS: RequestStatus = RequestStatus::PendingPayment;
}

/// Consumer reports having paid; waiting for the business to confirm.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmingPayment {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
}

impl RequestState for ConfirmingPayment {
    const STATUS: RequestStatus = RequestStatus::ConfirmingPayment;
}

/// Status found only in legacy documents; no edges lead in or out.
#[derive(Debug, Clone, Serialize)]
pub struct Paid {
    pub amount: Option<Decimal>,
    pub payment_method: Option<PaymentMethod>,
}

impl RequestState for Paid {
    const STATUS: RequestStatus = RequestStatus::Paid;
}

/// Finished without going through the payment flow. Can still be reviewed.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub amount: Option<Decimal>,
}

impl RequestState for Completed {
    const STATUS: RequestStatus = RequestStatus::Completed;
}

/// Payment confirmed by the business. Can be reviewed.
#[derive(Debug, Clone, Serialize)]
pub struct ReserviceAccomplished {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
}

impl RequestState for ReserviceAccomplished {
    const STATUS: RequestStatus = RequestStatus::ReserviceAccomplished;
}

/// The consumer left a review (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Reviewed {
    pub amount: Option<Decimal>,
    pub payment_method: Option<PaymentMethod>,
}

impl RequestState for Reviewed {
    const STATUS: RequestStatus = RequestStatus::Reviewed;
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request")]
pub enum AnyServiceRequest {
    Pending(ServiceRequest<Pending>),
    Accepted(ServiceRequest<Accepted>),
    Declined(ServiceRequest<Declined>),
    Cancelled(ServiceRequest<Cancelled>),
    PendingPayment(ServiceRequest<PendingPayment>),
    ConfirmingPayment(ServiceRequest<ConfirmingPayment>),
    Paid(ServiceRequest<Paid>),
    Completed(ServiceRequest<Completed>),
    ReserviceAccomplished(ServiceRequest<ReserviceAccomplished>),
    Reviewed(ServiceRequest<Reviewed>),
}

impl AnyServiceRequest {
    /// Get the request data regardless of state.
    pub fn data(&self) -> &RequestData {
        match self {
            AnyServiceRequest::Pending(r) => &r.data,
            AnyServiceRequest::Accepted(r) => &r.data,
            AnyServiceRequest::Declined(r) => &r.data,
            AnyServiceRequest::Cancelled(r) => &r.data,
            AnyServiceRequest::PendingPayment(r) => &r.data,
            AnyServiceRequest::ConfirmingPayment(r) => &r.data,
            AnyServiceRequest::Paid(r) => &r.data,
            AnyServiceRequest::Completed(r) => &r.data,
            AnyServiceRequest::ReserviceAccomplished(r) => &r.data,
            AnyServiceRequest::Reviewed(r) => &r.data,
        }
    }

    pub fn id(&self) -> RequestId {
        self.data().id
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyServiceRequest::Pending(_) => RequestStatus::Pending,
            AnyServiceRequest::Accepted(_) => RequestStatus::Accepted,
            AnyServiceRequest::Declined(_) => RequestStatus::Declined,
            AnyServiceRequest::Cancelled(_) => RequestStatus::Cancelled,
            AnyServiceRequest::PendingPayment(_) => RequestStatus::PendingPayment,
            AnyServiceRequest::ConfirmingPayment(_) => RequestStatus::ConfirmingPayment,
            AnyServiceRequest::Paid(_) => RequestStatus::Paid,
            AnyServiceRequest::Completed(_) => RequestStatus::Completed,
            AnyServiceRequest::ReserviceAccomplished(_) => RequestStatus::ReserviceAccomplished,
            AnyServiceRequest::Reviewed(_) => RequestStatus::Reviewed,
        }
    }

    /// The agreed amount, if one has been set.
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            AnyServiceRequest::Accepted(r) => r.state.amount,
            AnyServiceRequest::PendingPayment(r) => Some(r.state.amount),
            AnyServiceRequest::ConfirmingPayment(r) => Some(r.state.amount),
            AnyServiceRequest::Paid(r) => r.state.amount,
            AnyServiceRequest::Completed(r) => r.state.amount,
            AnyServiceRequest::ReserviceAccomplished(r) => Some(r.state.amount),
            AnyServiceRequest::Reviewed(r) => r.state.amount,
            AnyServiceRequest::Pending(_)
            | AnyServiceRequest::Declined(_)
            | AnyServiceRequest::Cancelled(_) => None,
        }
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        match self {
            AnyServiceRequest::ConfirmingPayment(r) => Some(r.state.payment_method),
            AnyServiceRequest::ReserviceAccomplished(r) => Some(r.state.payment_method),
            AnyServiceRequest::Paid(r) => r.state.payment_method,
            AnyServiceRequest::Reviewed(r) => r.state.payment_method,
            _ => None,
        }
    }

    /// Check if this request is in a state with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyServiceRequest::Pending(_))
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<ServiceRequest<Pending>> {
        match self {
            AnyServiceRequest::Pending(r) => Some(r),
            _ => None,
        }
    }
}

macro_rules! impl_from_typed {
    ($($state:ident),* $(,)?) => {
        $(
            impl From<ServiceRequest<$state>> for AnyServiceRequest {
                fn from(r: ServiceRequest<$state>) -> Self {
                    AnyServiceRequest::$state(r)
                }
            }
        )*
    };
}

impl_from_typed!(
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
);
