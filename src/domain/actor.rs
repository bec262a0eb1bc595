//! Caller identity passed explicitly into every core operation.

use serde::{Deserialize, Serialize};

use super::business::BusinessId;
use super::request::UserId;

/// Side of a service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    /// The account that requested the service.
    Consumer,
    /// The business the service was requested from.
    Business,
}

/// The authenticated account performing an operation.
///
/// Supplied by the auth collaborator; the core never reads a session on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub fn new(uid: impl Into<String>) -> Self {
        Actor(uid.into())
    }

    pub fn uid(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self, user_id: &UserId) -> bool {
        self.0 == user_id.0
    }

    pub fn is_business(&self, business_id: &BusinessId) -> bool {
        self.0 == business_id.0
    }

    /// The actor viewed as a consumer account.
    pub fn as_user(&self) -> UserId {
        UserId(self.0.clone())
    }

    /// The actor viewed as a business account (businesses share the owner's uid).
    pub fn as_business(&self) -> BusinessId {
        BusinessId(self.0.clone())
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
