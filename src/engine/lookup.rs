use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::AppError;
use crate::models::order::OrderDetails;

/// The order service's internal surface, keyed by order id.
#[async_trait]
pub trait OrderService: Send + Sync {
    async fn order_details(&self, order_id: &str) -> Result<OrderDetails, AppError>;

    async fn mark_delivered(&self, order_id: &str) -> Result<(), AppError>;
}

/// Rejects details whose coordinates cannot be used for matching.
pub fn validate_details(details: &OrderDetails) -> Result<(), AppError> {
    if !details.pickup().is_valid() {
        return Err(AppError::Lookup(format!(
            "invalid restaurant coordinates ({}, {})",
            details.restaurant_latitude, details.restaurant_longitude
        )));
    }

    if !details.dropoff().is_valid() {
        return Err(AppError::Lookup(format!(
            "invalid delivery coordinates ({}, {})",
            details.delivery_latitude, details.delivery_longitude
        )));
    }

    Ok(())
}

pub struct HttpOrderService {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpOrderService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl OrderService for HttpOrderService {
    async fn order_details(&self, order_id: &str) -> Result<OrderDetails, AppError> {
        let url = format!("{}/internal/order/{order_id}", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|err| AppError::Lookup(format!("GET {url}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Lookup(format!("GET {url}: HTTP {status}")));
        }

        let details: OrderDetails = response
            .json()
            .await
            .map_err(|err| AppError::Lookup(format!("undecodable order {order_id}: {err}")))?;

        validate_details(&details)?;
        debug!(order_id, "order details resolved");
        Ok(details)
    }

    async fn mark_delivered(&self, order_id: &str) -> Result<(), AppError> {
        let url = format!("{}/internal/order/{order_id}/complete", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&json!({ "status": "delivered" }))
            .send()
            .await
            .map_err(|err| AppError::Lookup(format!("POST {url}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Lookup(format!("POST {url}: HTTP {status} - {body}")));
        }

        Ok(())
    }
}
