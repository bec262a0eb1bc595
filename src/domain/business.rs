//! Business profiles, reviews, and the running rating average.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::{RequestId, UserId};
use crate::error::{HandymanError, Result};

/// Business identity. Same value as the owning account's uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessId(pub String);

impl BusinessId {
    pub fn new(uid: impl Into<String>) -> Self {
        BusinessId(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A registered business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Business {
    pub uid: BusinessId,
    pub business_name: String,
    pub manager_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub location: Option<GeoPoint>,
    pub services: BTreeSet<String>,
    /// Mean of all `rating_count` submitted ratings.
    pub average_rating: f64,
    pub rating_count: u32,
    /// Bumped on every write; guards the rating read-modify-write.
    pub version: u64,
}

/// Profile supplied when an account is upgraded to a business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBusiness {
    pub uid: BusinessId,
    pub business_name: String,
    pub manager_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl NewBusiness {
    pub fn validate(&self) -> Result<()> {
        if self.uid.0.trim().is_empty() {
            return Err(HandymanError::Validation("business uid is required".to_string()));
        }
        if self.business_name.trim().is_empty() {
            return Err(HandymanError::Validation(
                "businessName is required".to_string(),
            ));
        }
        if let Some(location) = self.location
            && (!(-90.0..=90.0).contains(&location.latitude)
                || !(-180.0..=180.0).contains(&location.longitude))
        {
            return Err(HandymanError::Validation(format!(
                "location ({}, {}) is out of range",
                location.latitude, location.longitude
            )));
        }
        Ok(())
    }

    /// Build the initial record: no ratings yet, version 0.
    pub fn into_business(self) -> Result<Business> {
        self.validate()?;
        let services = normalize_services(self.services)?;
        Ok(Business {
            uid: self.uid,
            business_name: self.business_name.trim().to_string(),
            manager_name: self.manager_name,
            contact_email: self.contact_email,
            contact_phone: self.contact_phone,
            location: self.location,
            services,
            average_rating: 0.0,
            rating_count: 0,
            version: 0,
        })
    }
}

/// Trim service categories and drop duplicates. Blank entries are rejected.
pub fn normalize_services<I, S>(services: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    services
        .into_iter()
        .map(|service| {
            let trimmed = service.as_ref().trim();
            if trimmed.is_empty() {
                Err(HandymanError::Validation(
                    "service categories must not be blank".to_string(),
                ))
            } else {
                Ok(trimmed.to_string())
            }
        })
        .collect()
}

/// A star rating between 1 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: i64) -> Result<Self> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Rating(value as u8))
        } else {
            Err(HandymanError::Validation(format!(
                "rating must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = HandymanError;

    fn try_from(value: i64) -> Result<Self> {
        Rating::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// Unique identifier for a review, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(pub Uuid);

impl fmt::Display for ReviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ReviewId {
    fn from(uuid: Uuid) -> Self {
        ReviewId(uuid)
    }
}

/// A submitted review. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: ReviewId,
    pub business_id: BusinessId,
    pub business_name: String,
    pub client_id: UserId,
    pub client_name: String,
    pub rating: Rating,
    pub comment: String,
    pub source_request_id: RequestId,
    pub created_at: DateTime<Utc>,
}

/// Review fields before the store assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReview {
    pub business_id: BusinessId,
    pub business_name: String,
    pub client_id: UserId,
    pub client_name: String,
    pub rating: Rating,
    pub comment: String,
    pub source_request_id: RequestId,
}

impl NewReview {
    pub fn into_review(self, id: ReviewId, created_at: DateTime<Utc>) -> Review {
        Review {
            id,
            business_id: self.business_id,
            business_name: self.business_name,
            client_id: self.client_id,
            client_name: self.client_name,
            rating: self.rating,
            comment: self.comment,
            source_request_id: self.source_request_id,
            created_at,
        }
    }
}

/// A business's rating fields as read at `version`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingSnapshot {
    pub business_id: BusinessId,
    pub business_name: String,
    pub average_rating: f64,
    pub rating_count: u32,
    pub version: u64,
}

/// Rating fields after folding in one more rating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FoldedRating {
    pub average_rating: f64,
    pub rating_count: u32,
}

impl RatingSnapshot {
    /// Weighted-mean update: `(avg * n + r) / (n + 1)`.
    pub fn fold(&self, rating: Rating) -> FoldedRating {
        let count = self.rating_count + 1;
        let total = self.average_rating * f64::from(self.rating_count) + f64::from(rating.value());
        FoldedRating {
            average_rating: total / f64::from(count),
            rating_count: count,
        }
    }
}
