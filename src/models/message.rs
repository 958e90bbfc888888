//! Wire messages exchanged over courier and customer WebSocket connections.

use serde::{Deserialize, Serialize};

use crate::models::order::OrderDetails;

pub const DELIVERY_CONFIRMED: &str = "delivery_confirmed";
pub const PICKUP_CONFIRMED: &str = "pickup_confirmed";
pub const COURIER_UNAVAILABLE: &str = "courier unavailable";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationReport {
    pub courier_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CourierEvent {
    pub event: String,
    pub order_id: String,
}

/// Anything a courier may send. Messages carrying an `event` field are events,
/// everything else must be a location report.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Event(CourierEvent),
    Location(LocationReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentMessage {
    pub order_id: String,
    pub restaurant_address: String,
    pub delivery_address: String,
    pub details: String,
}

impl AssignmentMessage {
    pub fn new(order_id: &str, details: &OrderDetails) -> Self {
        Self {
            order_id: order_id.to_string(),
            restaurant_address: details.restaurant_address.clone(),
            delivery_address: details.delivery_address.clone(),
            details: details.details.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TrackingMessage {
    Location {
        order_id: String,
        latitude: f64,
        longitude: f64,
    },
    Unavailable {
        message: String,
    },
}

impl TrackingMessage {
    pub fn unavailable() -> Self {
        TrackingMessage::Unavailable {
            message: COURIER_UNAVAILABLE.to_string(),
        }
    }
}

/// Everything the service pushes down a live connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Assignment(AssignmentMessage),
    Tracking(TrackingMessage),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
