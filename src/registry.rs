//! Endpoint registry: configuration CRUD, subscriptions, secrets, and the
//! operator read surface (delivery history, attempt logs, counters).
//!
//! Configuration errors surface synchronously to the caller; nothing here
//! runs on the delivery path.

use std::sync::Arc;

use url::Url;

use crate::catalog::EventCatalog;
use crate::error::RegistryError;
use crate::filter::FilterRule;
use crate::storage::Store;
use crate::types::{
    DeliveryAttempt, DeliveryId, EndpointConfig, EndpointId, EndpointStats, EndpointSubscription,
    EndpointStatus, RetryStrategy, SecretId, SecretMaterial, WebhookDelivery,
};

pub struct EndpointRegistry {
    store: Arc<dyn Store>,
    catalog: Arc<EventCatalog>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<EventCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Validate and persist a new endpoint configuration.
    pub async fn create(&self, endpoint: EndpointConfig) -> Result<EndpointConfig, RegistryError> {
        validate_endpoint(&endpoint)?;
        self.store.insert_endpoint(&endpoint).await?;
        Ok(endpoint)
    }

    /// Validate and persist changes to an existing endpoint.
    pub async fn update(&self, endpoint: EndpointConfig) -> Result<EndpointConfig, RegistryError> {
        validate_endpoint(&endpoint)?;
        if self.store.get_endpoint(endpoint.id).await?.is_none() {
            return Err(RegistryError::EndpointNotFound { id: endpoint.id });
        }
        self.store.update_endpoint(&endpoint).await?;
        Ok(endpoint)
    }

    pub async fn get(&self, id: EndpointId) -> Result<EndpointConfig, RegistryError> {
        self.store
            .get_endpoint(id)
            .await?
            .ok_or(RegistryError::EndpointNotFound { id })
    }

    pub async fn list(&self) -> Result<Vec<EndpointConfig>, RegistryError> {
        Ok(self.store.list_endpoints().await?)
    }

    /// Change the administrative status. Disabling stops new deliveries;
    /// in-flight retries complete or abandon normally.
    pub async fn set_status(
        &self,
        id: EndpointId,
        status: EndpointStatus,
    ) -> Result<(), RegistryError> {
        let mut endpoint = self.get(id).await?;
        endpoint.status = status;
        self.store.update_endpoint(&endpoint).await?;
        Ok(())
    }

    /// Remove an endpoint and its subscriptions, secrets, and filters.
    /// Delivery history is retained for audit.
    pub async fn delete(&self, id: EndpointId) -> Result<(), RegistryError> {
        if self.store.get_endpoint(id).await?.is_none() {
            return Err(RegistryError::EndpointNotFound { id });
        }
        self.store.delete_endpoint(id).await?;
        Ok(())
    }

    /// Subscribe an endpoint to an event type. Both sides must exist.
    pub async fn subscribe(
        &self,
        endpoint_id: EndpointId,
        event_type: &str,
    ) -> Result<(), RegistryError> {
        if self.store.get_endpoint(endpoint_id).await?.is_none() {
            return Err(RegistryError::EndpointNotFound { id: endpoint_id });
        }
        if !self.catalog.contains(event_type).await {
            return Err(RegistryError::EventTypeNotFound {
                name: event_type.to_string(),
            });
        }
        self.store
            .subscribe(&EndpointSubscription {
                endpoint_id,
                event_type: event_type.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        endpoint_id: EndpointId,
        event_type: &str,
    ) -> Result<(), RegistryError> {
        self.store
            .unsubscribe(&EndpointSubscription {
                endpoint_id,
                event_type: event_type.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn subscriptions(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<EndpointSubscription>, RegistryError> {
        Ok(self.store.subscriptions_for(endpoint_id).await?)
    }

    /// Attach a new signing secret. Existing secrets stay valid until
    /// retired or expired, so rotation never breaks in-flight deliveries.
    pub async fn add_secret(
        &self,
        endpoint_id: EndpointId,
        secret: SecretMaterial,
    ) -> Result<SecretId, RegistryError> {
        let mut endpoint = self.get(endpoint_id).await?;
        let id = secret.id;
        endpoint.secrets.push(secret);
        self.store.update_endpoint(&endpoint).await?;
        Ok(id)
    }

    /// Deactivate a secret. Historical attempt rows keep the signatures
    /// they were sent with; nothing is re-signed.
    pub async fn retire_secret(
        &self,
        endpoint_id: EndpointId,
        secret_id: SecretId,
    ) -> Result<(), RegistryError> {
        let mut endpoint = self.get(endpoint_id).await?;
        let secret = endpoint
            .secrets
            .iter_mut()
            .find(|s| s.id == secret_id)
            .ok_or(RegistryError::SecretNotFound { id: secret_id })?;
        secret.active = false;
        self.store.update_endpoint(&endpoint).await?;
        Ok(())
    }

    /// Replace the endpoint's filter rules.
    pub async fn set_filters(
        &self,
        endpoint_id: EndpointId,
        filters: Vec<FilterRule>,
    ) -> Result<(), RegistryError> {
        let mut endpoint = self.get(endpoint_id).await?;
        endpoint.filters = filters;
        self.store.update_endpoint(&endpoint).await?;
        Ok(())
    }

    /// Delivery history for operator diagnosis: status, attempt counts,
    /// last error per delivery.
    pub async fn deliveries(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Vec<WebhookDelivery>, RegistryError> {
        if self.store.get_endpoint(endpoint_id).await?.is_none() {
            return Err(RegistryError::EndpointNotFound { id: endpoint_id });
        }
        Ok(self.store.deliveries_for_endpoint(endpoint_id).await?)
    }

    /// Attempt log for one delivery, ordered by attempt number.
    pub async fn attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, RegistryError> {
        Ok(self.store.attempts_for_delivery(delivery_id).await?)
    }

    pub async fn stats(&self, endpoint_id: EndpointId) -> Result<EndpointStats, RegistryError> {
        Ok(self.store.endpoint_stats(endpoint_id).await?)
    }
}

fn validate_endpoint(endpoint: &EndpointConfig) -> Result<(), RegistryError> {
    let url = Url::parse(&endpoint.url)
        .map_err(|e| RegistryError::validation(format!("invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegistryError::validation(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }

    if endpoint.max_retry_attempts == 0 {
        return Err(RegistryError::validation("max_retry_attempts must be positive"));
    }
    if endpoint.timeout.is_zero() {
        return Err(RegistryError::validation("timeout must be positive"));
    }
    if endpoint.retry_delay.is_zero()
        && matches!(
            endpoint.retry_strategy,
            RetryStrategy::ExponentialBackoff
                | RetryStrategy::LinearBackoff
                | RetryStrategy::FixedInterval
        )
    {
        return Err(RegistryError::validation(
            "retry_delay must be positive for delayed retry strategies",
        ));
    }
    if endpoint.rate_limits.per_minute == Some(0) || endpoint.rate_limits.per_hour == Some(0) {
        return Err(RegistryError::validation("rate limits must be positive"));
    }

    Ok(())
}
