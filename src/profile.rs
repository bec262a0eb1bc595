//! Business profile operations, checked against the calling account.
//!
//! Rating fields are only ever written by [`crate::rating::RatingAggregator`];
//! nothing here can touch them.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::Actor;
use crate::domain::business::{Business, BusinessId, NewBusiness, Review, normalize_services};
use crate::error::{HandymanError, Result};
use crate::store::{BusinessStore, with_timeout};

pub struct BusinessProfiles<S> {
    store: Arc<S>,
    store_timeout: Duration,
}

impl<S> Clone for BusinessProfiles<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S: BusinessStore> BusinessProfiles<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            store_timeout: Duration::from_millis(10_000),
        }
    }

    pub fn with_store_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.store_timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Register the actor's own account as a business.
    #[tracing::instrument(skip(self, profile), fields(actor = %actor))]
    pub async fn upgrade(&self, actor: &Actor, profile: NewBusiness) -> Result<Business> {
        if !actor.is_business(&profile.uid) {
            return Err(HandymanError::Forbidden {
                actor: actor.uid().to_string(),
                action: "upgrade another account".to_string(),
            });
        }
        let business = with_timeout(
            self.store_timeout,
            "upgrade_to_business",
            self.store.upgrade_to_business(profile),
        )
        .await?;
        tracing::info!(business_id = %business.uid, "Account upgraded to business");
        Ok(business)
    }

    pub async fn get(&self, id: &BusinessId) -> Result<Business> {
        with_timeout(self.store_timeout, "get_business", self.store.get_business(id)).await
    }

    /// Replace the actor's advertised services. Entries are trimmed and
    /// deduplicated; blank entries are rejected.
    pub async fn update_services<I, T>(&self, actor: &Actor, services: I) -> Result<Business>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let services = normalize_services(services)?;
        let id = actor.as_business();
        tracing::debug!(business_id = %id, count = services.len(), "Updating services");
        with_timeout(
            self.store_timeout,
            "update_services",
            self.store.update_services(&id, services),
        )
        .await
    }

    /// Set or clear the manager name. Blank names clear it.
    pub async fn update_manager_name(&self, actor: &Actor, name: Option<&str>) -> Result<Business> {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let id = actor.as_business();
        with_timeout(
            self.store_timeout,
            "update_manager_name",
            self.store.update_manager_name(&id, name),
        )
        .await
    }

    /// Reviews of a business, newest first.
    pub async fn reviews(&self, id: &BusinessId) -> Result<Vec<Review>> {
        with_timeout(self.store_timeout, "list_reviews", self.store.list_reviews(id)).await
    }
}
