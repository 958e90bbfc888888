use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// Order data as returned by the order collaborator's internal lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(default)]
    pub order_id: Option<String>,
    pub restaurant_latitude: f64,
    pub restaurant_longitude: f64,
    pub delivery_latitude: f64,
    pub delivery_longitude: f64,
    #[serde(default)]
    pub restaurant_address: String,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub details: String,
}

impl OrderDetails {
    pub fn pickup(&self) -> GeoPoint {
        GeoPoint::new(self.restaurant_latitude, self.restaurant_longitude)
    }

    pub fn dropoff(&self) -> GeoPoint {
        GeoPoint::new(self.delivery_latitude, self.delivery_longitude)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Assigned,
    Delivering,
    Delivered,
    Failed,
    TimedOut,
}

impl DispatchStatus {
    /// Statuses in which a courier is bound and customers may track the order.
    pub fn is_trackable(self) -> bool {
        matches!(self, DispatchStatus::Assigned | DispatchStatus::Delivering)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    LookupFailed,
    NoCourier,
    NotConnected,
}

impl FailureReason {
    /// Only a missing courier is worth retrying; the other failures are final.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureReason::NoCourier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRecord {
    pub order_id: String,
    pub assigned_courier_id: Option<String>,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn pending(order_id: &str) -> Self {
        Self {
            order_id: order_id.to_string(),
            assigned_courier_id: None,
            status: DispatchStatus::Pending,
            failure: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            DispatchStatus::Delivered => true,
            DispatchStatus::Failed => !self.failure.is_some_and(FailureReason::is_retryable),
            _ => false,
        }
    }
}
