//! Persisted document shape of a service request.
//!
//! [`ServiceRequestRecord`] mirrors the stored fields one-to-one. Turning a record
//! into an [`AnyServiceRequest`] is the only way typed requests come out of a
//! store, and every inconsistency is reported as a validation error.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::*;
use super::status::RequestStatus;
use crate::domain::business::BusinessId;
use crate::domain::scheduling;
use crate::error::{HandymanError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequestRecord {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default)]
    pub business_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ServiceRequestRecord {
    /// A freshly created request: status `Pending`, stamped at `now`.
    pub fn new_pending(id: RequestId, draft: &ServiceRequestDraft, now: DateTime<Utc>) -> Self {
        let (service_category, service) = match &draft.service {
            ServiceKind::Category(name) => (Some(name.trim().to_string()), None),
            ServiceKind::Custom(text) => (None, Some(text.trim().to_string())),
        };
        ServiceRequestRecord {
            id: id.0.to_string(),
            user_id: Some(draft.user_id.0.clone()),
            user_name: draft.user_name.clone(),
            business_id: Some(draft.business_id.0.clone()),
            business_name: draft.business_name.clone(),
            service_category,
            service,
            scheduled_date_time: Some(draft.scheduled_at),
            scheduled_date: None,
            scheduled_time: None,
            amount: None,
            payment_method: None,
            status: RequestStatus::Pending.as_str().to_string(),
            timestamp: Some(now),
            updated_at: Some(now),
            idempotency_key: draft.idempotency_key.clone(),
        }
    }

    /// Decode a raw JSON document. Shape errors become validation errors.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| HandymanError::Validation(format!("malformed request document: {}", e)))
    }

    pub fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn business(&self) -> Option<&str> {
        self.business_id.as_deref()
    }

    /// Status normalized from the stored string, if it is recognizable.
    pub fn parsed_status(&self) -> Result<RequestStatus> {
        RequestStatus::from_stored(&self.status)
    }

    fn request_data(&self) -> Result<RequestData> {
        let id = Uuid::parse_str(&self.id)
            .map(RequestId)
            .map_err(|e| HandymanError::Validation(format!("invalid request id '{}': {}", self.id, e)))?;

        let user_id = required(&self.user_id, "userId", &self.id)?;
        let business_id = required(&self.business_id, "businessId", &self.id)?;

        let service = match (&self.service_category, &self.service) {
            (Some(category), _) if !category.trim().is_empty() => {
                ServiceKind::Category(category.trim().to_string())
            }
            (_, Some(text)) if !text.trim().is_empty() => ServiceKind::Custom(text.trim().to_string()),
            _ => {
                return Err(HandymanError::Validation(format!(
                    "request {} has neither serviceCategory nor service",
                    self.id
                )));
            }
        };

        let scheduled_at = match (
            self.scheduled_date_time,
            &self.scheduled_date,
            &self.scheduled_time,
        ) {
            (Some(at), _, _) => at,
            (None, Some(date), Some(time)) => scheduling::parse_legacy_schedule(date, time)?,
            _ => {
                return Err(HandymanError::Validation(format!(
                    "request {} has no schedule",
                    self.id
                )));
            }
        };

        let created_at = self.timestamp.ok_or_else(|| {
            HandymanError::Validation(format!("request {} has no timestamp", self.id))
        })?;

        Ok(RequestData {
            id,
            user_id: UserId(user_id),
            user_name: self.user_name.clone(),
            business_id: BusinessId(business_id),
            business_name: self.business_name.clone(),
            service,
            scheduled_at,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
            idempotency_key: self.idempotency_key.clone(),
        })
    }
}

fn required(field: &Option<String>, name: &str, id: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(HandymanError::Validation(format!(
            "request {} is missing {}",
            id, name
        ))),
    }
}

impl TryFrom<ServiceRequestRecord> for AnyServiceRequest {
    type Error = HandymanError;

    fn try_from(record: ServiceRequestRecord) -> Result<Self> {
        let status = record.parsed_status()?;
        let data = record.request_data()?;
        let amount = record.amount.map(validate_amount).transpose()?;
        let payment_method = record
            .payment_method
            .as_deref()
            .map(str::parse::<PaymentMethod>)
            .transpose()?;
        let id = data.id;

        let need_amount = || {
            amount.ok_or_else(|| {
                HandymanError::Validation(format!(
                    "request {} is '{}' but has no amount",
                    id, status
                ))
            })
        };
        let need_method = || {
            payment_method.ok_or_else(|| {
                HandymanError::Validation(format!(
                    "request {} is '{}' but has no payment method",
                    id, status
                ))
            })
        };

        let request = match status {
            RequestStatus::Pending => ServiceRequest {
                state: Pending,
                data,
            }
            .into(),
            RequestStatus::Declined => ServiceRequest {
                state: Declined,
                data,
            }
            .into(),
            RequestStatus::Cancelled => ServiceRequest {
                state: Cancelled,
                data,
            }
            .into(),
            RequestStatus::Accepted => ServiceRequest {
                state: Accepted { amount },
                data,
            }
            .into(),
            RequestStatus::PendingPayment => ServiceRequest {
                state: PendingPayment {
                    amount: need_amount()?,
                },
                data,
            }
            .into(),
            RequestStatus::ConfirmingPayment => ServiceRequest {
                state: ConfirmingPayment {
                    amount: need_amount()?,
                    payment_method: need_method()?,
                },
                data,
            }
            .into(),
            RequestStatus::Paid => ServiceRequest {
                state: Paid {
                    amount,
                    payment_method,
                },
                data,
            }
            .into(),
            RequestStatus::Completed => ServiceRequest {
                state: Completed { amount },
                data,
            }
            .into(),
            RequestStatus::ReserviceAccomplished => ServiceRequest {
                state: ReserviceAccomplished {
                    amount: need_amount()?,
                    payment_method: need_method()?,
                },
                data,
            }
            .into(),
            RequestStatus::Reviewed => ServiceRequest {
                state: Reviewed {
                    amount,
                    payment_method,
                },
                data,
            }
            .into(),
        };
        Ok(request)
    }
}

impl From<&AnyServiceRequest> for ServiceRequestRecord {
    fn from(request: &AnyServiceRequest) -> Self {
        let data = request.data();
        let (service_category, service) = match &data.service {
            ServiceKind::Category(name) => (Some(name.clone()), None),
            ServiceKind::Custom(text) => (None, Some(text.clone())),
        };
        ServiceRequestRecord {
            id: data.id.0.to_string(),
            user_id: Some(data.user_id.0.clone()),
            user_name: data.user_name.clone(),
            business_id: Some(data.business_id.0.clone()),
            business_name: data.business_name.clone(),
            service_category,
            service,
            scheduled_date_time: Some(data.scheduled_at),
            scheduled_date: None,
            scheduled_time: None,
            amount: request.amount(),
            payment_method: request.payment_method().map(|m| m.as_str().to_string()),
            status: request.status().as_str().to_string(),
            timestamp: Some(data.created_at),
            updated_at: Some(data.updated_at),
            idempotency_key: data.idempotency_key.clone(),
        }
    }
}
