use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::dispatcher::Dispatcher;
use crate::models::courier::CourierSnapshot;
use crate::models::message::{OutboundMessage, TrackingMessage};
use crate::observability::metrics::Metrics;
use crate::registry::CourierRegistry;
use crate::session::SessionManager;

pub fn tracking_message(order_id: &str, courier: Option<&CourierSnapshot>) -> TrackingMessage {
    let location = courier
        .filter(|courier| courier.record.is_active)
        .and_then(|courier| courier.record.location);

    match location {
        Some(location) => TrackingMessage::Location {
            order_id: order_id.to_string(),
            latitude: location.lat,
            longitude: location.lng,
        },
        None => TrackingMessage::unavailable(),
    }
}

/// Pushes the bound courier's position to everyone watching an order.
pub struct TrackingPublisher {
    registry: Arc<CourierRegistry>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    metrics: Metrics,
    interval: Duration,
}

impl TrackingPublisher {
    pub fn new(
        registry: Arc<CourierRegistry>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            dispatcher,
            metrics,
            interval,
        }
    }

    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "tracking publisher started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.publish_once();
        }
    }

    /// One tick: returns how many messages reached subscribers.
    pub fn publish_once(&self) -> usize {
        let mut delivered = 0;

        for order_id in self.sessions.watched_orders() {
            let Some(record) = self.dispatcher.record(&order_id) else {
                continue;
            };
            if !record.status.is_trackable() {
                continue;
            }

            let Some(courier_id) = record
                .assigned_courier_id
                .or_else(|| self.registry.courier_for_order(&order_id))
            else {
                continue;
            };

            let courier = self.registry.get(&courier_id);
            let message = OutboundMessage::Tracking(tracking_message(&order_id, courier.as_ref()));
            delivered += self.sessions.broadcast_tracking(&order_id, &message);
        }

        if delivered > 0 {
            debug!(delivered, "tracking updates pushed");
            self.metrics.tracking_updates_total.inc_by(delivered as u64);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::testing::{FakeOrders, Harness};

    fn publisher(harness: &Harness) -> TrackingPublisher {
        TrackingPublisher::new(
            harness.registry.clone(),
            harness.sessions.clone(),
            harness.dispatcher.clone(),
            harness.metrics.clone(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn location_sent_by_courier_reaches_the_customer() {
        let harness = Harness::new(FakeOrders::at(40.0, -74.0));
        let _c1 = harness.connect("c1", 40.0, -74.0);
        harness.dispatcher.on_order_ready("o1").await;
        let (tx, mut customer_rx) = mpsc::unbounded_channel();
        harness.sessions.subscribe_tracking("o1", tx);

        harness
            .sessions
            .on_inbound_text("c1", r#"{"courier_id":"c1","latitude":40.2,"longitude":-74.3}"#);
        let delivered = publisher(&harness).publish_once();

        assert_eq!(delivered, 1);
        assert_eq!(
            customer_rx.try_recv().unwrap(),
            OutboundMessage::Tracking(TrackingMessage::Location {
                order_id: "o1".to_string(),
                latitude: 40.2,
                longitude: -74.3,
            })
        );
        assert_eq!(harness.metrics.tracking_updates_total.get(), 1);
    }

    #[tokio::test]
    async fn disconnected_courier_is_reported_unavailable() {
        let harness = Harness::new(FakeOrders::at(40.0, -74.0));
        let (courier_tx, _courier_rx) = mpsc::unbounded_channel();
        let session = harness.sessions.open("c1", courier_tx);
        harness.registry.upsert_location("c1", 40.0, -74.0);
        harness.dispatcher.on_order_ready("o1").await;
        let (tx, mut customer_rx) = mpsc::unbounded_channel();
        harness.sessions.subscribe_tracking("o1", tx);

        harness.sessions.close("c1", session);
        publisher(&harness).publish_once();

        assert_eq!(
            customer_rx.try_recv().unwrap(),
            OutboundMessage::Tracking(TrackingMessage::unavailable())
        );
    }

    #[tokio::test]
    async fn unassigned_orders_are_not_tracked() {
        let harness = Harness::new(FakeOrders::at(40.0, -74.0));
        harness.dispatcher.on_order_ready("o2").await;
        let (tx, mut customer_rx) = mpsc::unbounded_channel();
        harness.sessions.subscribe_tracking("o2", tx);
        let (tx, mut unknown_rx) = mpsc::unbounded_channel();
        harness.sessions.subscribe_tracking("nobody-ordered-this", tx);

        assert_eq!(publisher(&harness).publish_once(), 0);
        assert!(customer_rx.try_recv().is_err());
        assert!(unknown_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_courier_reads_as_unavailable() {
        assert_eq!(tracking_message("o1", None), TrackingMessage::unavailable());
    }
}
