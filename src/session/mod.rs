//! Live courier sessions and customer tracking subscriptions.
//!
//! Connection handles never leave this module: a WebSocket task registers the
//! sending half of its outbound channel and everybody else asks the manager to
//! deliver a message by courier or order id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::message::{
    CourierEvent, InboundMessage, LocationReport, OutboundMessage, DELIVERY_CONFIRMED,
    PICKUP_CONFIRMED,
};
use crate::observability::metrics::Metrics;
use crate::registry::CourierRegistry;

pub type SessionId = u64;
pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;

/// Session activity the dispatcher has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    CourierOnline { courier_id: String },
    PickupConfirmed { courier_id: String, order_id: String },
    DeliveryConfirmed { courier_id: String, order_id: String },
}

struct CourierSession {
    id: SessionId,
    tx: OutboundSender,
}

struct Watcher {
    id: SessionId,
    tx: OutboundSender,
}

pub struct SessionManager {
    registry: Arc<CourierRegistry>,
    sessions: DashMap<String, CourierSession>,
    watchers: DashMap<String, Vec<Watcher>>,
    next_id: AtomicU64,
    signals: mpsc::UnboundedSender<SessionSignal>,
    metrics: Metrics,
}

impl SessionManager {
    pub fn new(
        registry: Arc<CourierRegistry>,
        metrics: Metrics,
    ) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                sessions: DashMap::new(),
                watchers: DashMap::new(),
                next_id: AtomicU64::new(1),
                signals,
                metrics,
            },
            signal_rx,
        )
    }

    /// Registers a courier connection, replacing any previous one for the same
    /// courier, and marks the courier active.
    pub fn open(&self, courier_id: &str, tx: OutboundSender) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = CourierSession { id, tx };

        // the entry guard serializes open/close for this courier, so the
        // active flag always matches the session table
        let entry = self.sessions.entry(courier_id.to_string());
        self.registry.set_active(courier_id, true);
        let replaced = match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(session);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                false
            }
        };

        if replaced {
            info!(courier_id, session_id = id, "courier session replaced");
        } else {
            self.metrics.active_sessions.inc();
            info!(courier_id, session_id = id, "courier session opened");
        }

        self.signal(SessionSignal::CourierOnline {
            courier_id: courier_id.to_string(),
        });
        id
    }

    /// Drops the session if it is still the current one for the courier and
    /// marks the courier inactive. `is_busy` is left for the reaper.
    pub fn close(&self, courier_id: &str, session_id: SessionId) -> bool {
        match self.sessions.entry(courier_id.to_string()) {
            Entry::Occupied(occupied) if occupied.get().id == session_id => {
                self.registry.set_active(courier_id, false);
                occupied.remove();
                self.metrics.active_sessions.dec();
                info!(courier_id, session_id, "courier session closed");
                true
            }
            _ => {
                debug!(courier_id, session_id, "superseded session closed");
                false
            }
        }
    }

    pub fn is_connected(&self, courier_id: &str) -> bool {
        self.sessions.contains_key(courier_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Best-effort push to a courier.
    pub fn send(&self, courier_id: &str, message: OutboundMessage) -> Result<(), AppError> {
        let session = self
            .sessions
            .get(courier_id)
            .ok_or_else(|| AppError::NotConnected(courier_id.to_string()))?;

        session
            .tx
            .send(message)
            .map_err(|_| AppError::NotConnected(courier_id.to_string()))
    }

    /// Handles one raw text frame from a courier. Malformed frames are dropped
    /// without affecting the connection.
    pub fn on_inbound_text(&self, courier_id: &str, text: &str) {
        let message = match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(courier_id, error = %err, "dropping malformed courier message");
                return;
            }
        };

        let result = match message {
            InboundMessage::Location(report) => self.on_inbound_location(courier_id, &report),
            InboundMessage::Event(event) => self.on_inbound_event(courier_id, &event),
        };

        if let Err(err) = result {
            warn!(courier_id, error = %err, "dropping courier message");
        }
    }

    pub fn on_inbound_location(
        &self,
        courier_id: &str,
        report: &LocationReport,
    ) -> Result<(), AppError> {
        if report.courier_id != courier_id {
            return Err(AppError::BadRequest(format!(
                "location for {} sent on session of {courier_id}",
                report.courier_id
            )));
        }

        let point = crate::geo::GeoPoint::new(report.latitude, report.longitude);
        if !point.is_valid() {
            return Err(AppError::BadRequest(format!(
                "invalid coordinates ({}, {})",
                report.latitude, report.longitude
            )));
        }

        self.registry
            .upsert_location(courier_id, report.latitude, report.longitude);
        Ok(())
    }

    pub fn on_inbound_event(&self, courier_id: &str, event: &CourierEvent) -> Result<(), AppError> {
        let signal = match event.event.as_str() {
            DELIVERY_CONFIRMED => SessionSignal::DeliveryConfirmed {
                courier_id: courier_id.to_string(),
                order_id: event.order_id.clone(),
            },
            PICKUP_CONFIRMED => SessionSignal::PickupConfirmed {
                courier_id: courier_id.to_string(),
                order_id: event.order_id.clone(),
            },
            other => {
                debug!(courier_id, event = other, "ignoring unknown courier event");
                return Ok(());
            }
        };

        self.signals
            .send(signal)
            .map_err(|_| AppError::Messaging("session signal channel closed".to_string()))
    }

    pub fn subscribe_tracking(&self, order_id: &str, tx: OutboundSender) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .entry(order_id.to_string())
            .or_default()
            .push(Watcher { id, tx });
        debug!(order_id, subscriber_id = id, "tracking subscriber added");
        id
    }

    pub fn unsubscribe_tracking(&self, order_id: &str, subscriber_id: SessionId) {
        if let Some(mut watchers) = self.watchers.get_mut(order_id) {
            watchers.retain(|watcher| watcher.id != subscriber_id);
        }
        self.watchers.remove_if(order_id, |_, watchers| watchers.is_empty());
    }

    pub fn watched_orders(&self) -> Vec<String> {
        self.watchers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Pushes a message to every watcher of the order and returns how many
    /// received it. Watchers whose connection is gone are pruned.
    pub fn broadcast_tracking(&self, order_id: &str, message: &OutboundMessage) -> usize {
        let delivered = match self.watchers.get_mut(order_id) {
            Some(mut watchers) => {
                watchers.retain(|watcher| watcher.tx.send(message.clone()).is_ok());
                watchers.len()
            }
            None => 0,
        };

        if delivered == 0 {
            self.watchers.remove_if(order_id, |_, watchers| watchers.is_empty());
        }
        delivered
    }

    fn signal(&self, signal: SessionSignal) {
        if self.signals.send(signal).is_err() {
            warn!("session signal channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::TrackingMessage;

    fn manager() -> (
        Arc<CourierRegistry>,
        SessionManager,
        mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        let registry = Arc::new(CourierRegistry::new());
        let (sessions, signals) = SessionManager::new(registry.clone(), Metrics::new());
        (registry, sessions, signals)
    }

    fn tracking(order_id: &str) -> OutboundMessage {
        OutboundMessage::Tracking(TrackingMessage::Location {
            order_id: order_id.to_string(),
            latitude: 1.0,
            longitude: 2.0,
        })
    }

    #[test]
    fn open_marks_courier_active_and_signals() {
        let (registry, sessions, mut signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();

        sessions.open("c1", tx);

        assert!(registry.get("c1").unwrap().record.is_active);
        assert!(sessions.is_connected("c1"));
        assert_eq!(
            signals.try_recv().unwrap(),
            SessionSignal::CourierOnline {
                courier_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn close_clears_active_but_not_busy() {
        let (registry, sessions, _signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = sessions.open("c1", tx);
        registry.upsert_location("c1", 1.0, 1.0);
        assert!(registry.try_mark_busy("c1"));

        assert!(sessions.close("c1", id));

        let record = registry.get("c1").unwrap().record;
        assert!(!record.is_active);
        assert!(record.is_busy);
        assert!(!sessions.is_connected("c1"));
    }

    #[test]
    fn closing_a_superseded_session_keeps_the_new_one() {
        let (registry, sessions, _signals) = manager();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();

        let old_id = sessions.open("c1", old_tx);
        sessions.open("c1", new_tx);

        assert!(!sessions.close("c1", old_id));
        assert!(registry.get("c1").unwrap().record.is_active);
        assert_eq!(sessions.session_count(), 1);

        sessions.send("c1", tracking("o1")).unwrap();
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn send_without_session_is_not_connected() {
        let (_registry, sessions, _signals) = manager();
        assert!(matches!(
            sessions.send("c1", tracking("o1")),
            Err(AppError::NotConnected(_))
        ));
    }

    #[test]
    fn send_to_dropped_receiver_is_not_connected() {
        let (_registry, sessions, _signals) = manager();
        let (tx, rx) = mpsc::unbounded_channel();
        sessions.open("c1", tx);
        drop(rx);

        assert!(matches!(
            sessions.send("c1", tracking("o1")),
            Err(AppError::NotConnected(_))
        ));
    }

    #[test]
    fn location_from_the_bound_courier_is_recorded() {
        let (registry, sessions, _signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.open("c1", tx);

        sessions.on_inbound_text("c1", r#"{"courier_id":"c1","latitude":40.5,"longitude":-73.5}"#);

        let location = registry.get("c1").unwrap().record.location.unwrap();
        assert_eq!(location.lat, 40.5);
        assert_eq!(location.lng, -73.5);
    }

    #[test]
    fn location_for_another_courier_is_ignored() {
        let (registry, sessions, _signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.open("c1", tx);

        sessions.on_inbound_text("c1", r#"{"courier_id":"c2","latitude":40.5,"longitude":-73.5}"#);

        assert!(registry.get("c2").is_none());
        assert!(registry.get("c1").unwrap().record.location.is_none());
    }

    #[test]
    fn malformed_and_unknown_messages_are_dropped() {
        let (_registry, sessions, mut signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.open("c1", tx);
        let _online = signals.try_recv().unwrap();

        sessions.on_inbound_text("c1", "{not json");
        sessions.on_inbound_text("c1", r#"{"event":"coffee_break","order_id":"o1"}"#);
        sessions.on_inbound_text("c1", r#"{"courier_id":"c1","latitude":95.0,"longitude":0.0}"#);

        assert!(signals.try_recv().is_err());
        assert!(sessions.is_connected("c1"));
    }

    #[test]
    fn delivery_confirmation_is_forwarded() {
        let (_registry, sessions, mut signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.open("c1", tx);
        let _online = signals.try_recv().unwrap();

        sessions.on_inbound_text("c1", r#"{"event":"delivery_confirmed","order_id":"o1"}"#);

        assert_eq!(
            signals.try_recv().unwrap(),
            SessionSignal::DeliveryConfirmed {
                courier_id: "c1".to_string(),
                order_id: "o1".to_string()
            }
        );
    }

    #[test]
    fn tracking_broadcast_reaches_watchers_and_prunes_closed_ones() {
        let (_registry, sessions, _signals) = manager();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        sessions.subscribe_tracking("o1", live_tx);
        sessions.subscribe_tracking("o1", dead_tx);
        drop(dead_rx);

        assert_eq!(sessions.broadcast_tracking("o1", &tracking("o1")), 1);
        assert_eq!(live_rx.try_recv().unwrap(), tracking("o1"));
        assert_eq!(sessions.watched_orders(), vec!["o1".to_string()]);
    }

    #[test]
    fn unsubscribing_the_last_watcher_stops_watching() {
        let (_registry, sessions, _signals) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = sessions.subscribe_tracking("o1", tx);

        sessions.unsubscribe_tracking("o1", id);

        assert!(sessions.watched_orders().is_empty());
        assert_eq!(sessions.broadcast_tracking("o1", &tracking("o1")), 0);
    }
}
