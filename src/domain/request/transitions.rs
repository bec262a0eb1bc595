//! State transitions for service requests using the typestate pattern.
//!
//! Each status is a distinct type parameter on `ServiceRequest<State>`, so only the
//! lifecycle edges exist as methods:
//!
//! ```text
//! ServiceRequest<Pending> ──cancel()──> ServiceRequest<Cancelled>
//!        │ ──decline()──> ServiceRequest<Declined>
//!        └──accept(amount?)──> ServiceRequest<Accepted>
//!                                  │ ──mark_complete()──> ServiceRequest<Completed>
//!                                  └──request_payment(amount?)──> ServiceRequest<PendingPayment>
//!
//! ServiceRequest<PendingPayment> ──submit_payment(method)──> ServiceRequest<ConfirmingPayment>
//! ServiceRequest<ConfirmingPayment> ──confirm_payment()──> ServiceRequest<ReserviceAccomplished>
//! ServiceRequest<ReserviceAccomplished | Completed> ──into_reviewed()──> ServiceRequest<Reviewed>
//! ```
//!
//! Every persisted transition is a single guarded write: the store only applies it
//! if the stored status still equals the status the request was read in, and
//! returns [`HandymanError::TransactionConflict`] otherwise. Side fields (amount,
//! payment method) are validated before the write and land in the same write as
//! the status.
//!
//! `into_reviewed` does not persist on its own. Reviews span the business record
//! and are committed by [`crate::rating::RatingAggregator`] in one transaction.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;

use super::state::{
    Accepted, AnyServiceRequest, Cancelled, Completed, ConfirmingPayment, Declined,
    PaymentMethod, Pending, PendingPayment, RequestData, RequestState, ReserviceAccomplished,
    Reviewed, ServiceRequest, validate_amount,
};
use super::status::RequestStatus;
use crate::error::{HandymanError, Result};
use crate::store::RequestStore;

async fn advance<T, S>(
    from: RequestStatus,
    mut data: RequestData,
    state: T,
    store: &S,
) -> Result<ServiceRequest<T>>
where
    T: RequestState + Clone,
    S: RequestStore + ?Sized,
    AnyServiceRequest: From<ServiceRequest<T>>,
{
    debug_assert!(from.can_transition_to(T::STATUS));
    data.updated_at = Utc::now();
    let request = ServiceRequest { state, data };
    store.persist_transition(from, &request).await?;

    counter!(
        "handyman_transitions_total",
        "from" => from.as_str(),
        "to" => T::STATUS.as_str()
    )
    .increment(1);
    tracing::info!(
        request_id = %request.data.id,
        from = %from,
        to = %T::STATUS,
        "Request transitioned"
    );
    Ok(request)
}

impl ServiceRequest<Pending> {
    pub async fn cancel<S: RequestStore + ?Sized>(
        self,
        store: &S,
    ) -> Result<ServiceRequest<Cancelled>> {
        advance(RequestStatus::Pending, self.data, Cancelled, store).await
    }

    pub async fn decline<S: RequestStore + ?Sized>(
        self,
        store: &S,
    ) -> Result<ServiceRequest<Declined>> {
        advance(RequestStatus::Pending, self.data, Declined, store).await
    }

    /// Accept the job, optionally quoting an amount (must be positive).
    pub async fn accept<S: RequestStore + ?Sized>(
        self,
        amount: Option<Decimal>,
        store: &S,
    ) -> Result<ServiceRequest<Accepted>> {
        let amount = amount.map(validate_amount).transpose()?;
        advance(RequestStatus::Pending, self.data, Accepted { amount }, store).await
    }
}

impl ServiceRequest<Accepted> {
    /// Ask the consumer to pay. An amount must be supplied here unless one was
    /// quoted at acceptance; a supplied amount replaces the quote.
    pub async fn request_payment<S: RequestStore + ?Sized>(
        self,
        amount: Option<Decimal>,
        store: &S,
    ) -> Result<ServiceRequest<PendingPayment>> {
        let amount = match (amount, self.state.amount) {
            (Some(amount), _) => validate_amount(amount)?,
            (None, Some(quoted)) => quoted,
            (None, None) => {
                return Err(HandymanError::Validation(format!(
                    "request {} has no agreed amount; an amount is required to request payment",
                    self.data.id
                )));
            }
        };
        advance(
            RequestStatus::Accepted,
            self.data,
            PendingPayment { amount },
            store,
        )
        .await
    }

    pub async fn mark_complete<S: RequestStore + ?Sized>(
        self,
        store: &S,
    ) -> Result<ServiceRequest<Completed>> {
        let amount = self.state.amount;
        advance(
            RequestStatus::Accepted,
            self.data,
            Completed { amount },
            store,
        )
        .await
    }
}

impl ServiceRequest<PendingPayment> {
    pub async fn submit_payment<S: RequestStore + ?Sized>(
        self,
        payment_method: PaymentMethod,
        store: &S,
    ) -> Result<ServiceRequest<ConfirmingPayment>> {
        let state = ConfirmingPayment {
            amount: self.state.amount,
            payment_method,
        };
        advance(RequestStatus::PendingPayment, self.data, state, store).await
    }
}

impl ServiceRequest<ConfirmingPayment> {
    pub async fn confirm_payment<S: RequestStore + ?Sized>(
        self,
        store: &S,
    ) -> Result<ServiceRequest<ReserviceAccomplished>> {
        let state = ReserviceAccomplished {
            amount: self.state.amount,
            payment_method: self.state.payment_method,
        };
        advance(RequestStatus::ConfirmingPayment, self.data, state, store).await
    }
}

impl ServiceRequest<ReserviceAccomplished> {
    pub fn into_reviewed(self, at: DateTime<Utc>) -> ServiceRequest<Reviewed> {
        ServiceRequest {
            state: Reviewed {
                amount: Some(self.state.amount),
                payment_method: Some(self.state.payment_method),
            },
            data: RequestData {
                updated_at: at,
                ..self.data
            },
        }
    }
}

impl ServiceRequest<Completed> {
    pub fn into_reviewed(self, at: DateTime<Utc>) -> ServiceRequest<Reviewed> {
        ServiceRequest {
            state: Reviewed {
                amount: self.state.amount,
                payment_method: None,
            },
            data: RequestData {
                updated_at: at,
                ..self.data
            },
        }
    }
}

impl AnyServiceRequest {
    /// The reviewed form of a request in a reviewable status.
    pub fn into_reviewed(self, at: DateTime<Utc>) -> Result<ServiceRequest<Reviewed>> {
        match self {
            AnyServiceRequest::ReserviceAccomplished(r) => Ok(r.into_reviewed(at)),
            AnyServiceRequest::Completed(r) => Ok(r.into_reviewed(at)),
            other => Err(HandymanError::InvalidTransition {
                from: other.status(),
                to: RequestStatus::Reviewed,
            }),
        }
    }
}
