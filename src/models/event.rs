use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::FailureReason;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OrderAssigned,
    OrderDelivered,
    CourierTimeout,
    OrderFailed,
}

/// Append-only analytics record for one dispatch transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchEvent {
    pub event_id: Uuid,
    pub event: EventKind,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub courier_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub timestamp: i64,
}

impl DispatchEvent {
    fn new(event: EventKind, order_id: &str, courier_id: Option<&str>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event,
            order_id: order_id.to_string(),
            courier_id: courier_id.map(str::to_string),
            reason: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn assigned(order_id: &str, courier_id: &str) -> Self {
        Self::new(EventKind::OrderAssigned, order_id, Some(courier_id))
    }

    pub fn delivered(order_id: &str, courier_id: &str) -> Self {
        Self::new(EventKind::OrderDelivered, order_id, Some(courier_id))
    }

    pub fn courier_timeout(order_id: &str, courier_id: &str) -> Self {
        Self::new(EventKind::CourierTimeout, order_id, Some(courier_id))
    }

    pub fn failed(order_id: &str, courier_id: Option<&str>, reason: FailureReason) -> Self {
        let mut event = Self::new(EventKind::OrderFailed, order_id, courier_id);
        event.reason = Some(reason);
        event
    }
}
