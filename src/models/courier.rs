use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// Live state of one courier as held by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierRecord {
    /// Unknown until the courier's first location report.
    pub location: Option<GeoPoint>,
    pub is_active: bool,
    pub is_busy: bool,
    /// Epoch seconds of the last registry write for this courier.
    pub last_update: i64,
}

impl CourierRecord {
    pub fn new(now: i64) -> Self {
        Self {
            location: None,
            is_active: false,
            is_busy: false,
            last_update: now,
        }
    }

    /// Active, idle, and with a known position to rank by.
    pub fn is_available(&self) -> bool {
        self.is_active && !self.is_busy && self.location.is_some()
    }

    /// Advances `last_update` without ever moving it backwards.
    pub fn touch(&mut self, now: i64) {
        self.last_update = self.last_update.max(now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierSnapshot {
    pub courier_id: String,
    #[serde(flatten)]
    pub record: CourierRecord,
}
