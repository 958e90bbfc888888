//! In-memory wiring shared by the engine tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::engine::dispatcher::Dispatcher;
use crate::engine::lookup::OrderService;
use crate::engine::queue::OrderQueue;
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::messaging::events::EventLog;
use crate::models::event::{DispatchEvent, EventKind};
use crate::models::message::OutboundMessage;
use crate::models::order::OrderDetails;
use crate::observability::metrics::Metrics;
use crate::registry::CourierRegistry;
use crate::session::{SessionManager, SessionSignal};

/// Order service returning the same pickup point for every order.
pub(crate) struct FakeOrders {
    pickup: GeoPoint,
    failing: HashSet<String>,
    pub(crate) delivered: Mutex<Vec<String>>,
}

impl FakeOrders {
    pub(crate) fn at(lat: f64, lng: f64) -> Self {
        Self {
            pickup: GeoPoint::new(lat, lng),
            failing: HashSet::new(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_for(mut self, order_id: &str) -> Self {
        self.failing.insert(order_id.to_string());
        self
    }
}

#[async_trait]
impl OrderService for FakeOrders {
    async fn order_details(&self, order_id: &str) -> Result<OrderDetails, AppError> {
        if self.failing.contains(order_id) {
            return Err(AppError::Lookup("HTTP 500".to_string()));
        }

        Ok(OrderDetails {
            order_id: Some(order_id.to_string()),
            restaurant_latitude: self.pickup.lat,
            restaurant_longitude: self.pickup.lng,
            delivery_latitude: self.pickup.lat + 0.01,
            delivery_longitude: self.pickup.lng + 0.01,
            restaurant_address: "1 Kitchen St".to_string(),
            delivery_address: "2 Home Ave".to_string(),
            details: "2x plov".to_string(),
        })
    }

    async fn mark_delivered(&self, order_id: &str) -> Result<(), AppError> {
        self.delivered.lock().unwrap().push(order_id.to_string());
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) metrics: Metrics,
    pub(crate) registry: Arc<CourierRegistry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) signals: mpsc::UnboundedReceiver<SessionSignal>,
    pub(crate) orders: Arc<FakeOrders>,
    pub(crate) event_log: Arc<EventLog>,
    pub(crate) events: broadcast::Receiver<DispatchEvent>,
    pub(crate) queue_rx: mpsc::Receiver<String>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub(crate) fn new(orders: FakeOrders) -> Self {
        let metrics = Metrics::new();
        let registry = Arc::new(CourierRegistry::new());
        let (sessions, signals) = SessionManager::new(registry.clone(), metrics.clone());
        let sessions = Arc::new(sessions);
        let event_log = Arc::new(EventLog::new(64));
        let events = event_log.subscribe();
        let (queue, queue_rx) = OrderQueue::new(64, metrics.clone());
        let orders = Arc::new(orders);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            orders.clone(),
            event_log.clone(),
            queue,
            metrics.clone(),
            16,
        ));

        Self {
            metrics,
            registry,
            sessions,
            signals,
            orders,
            event_log,
            events,
            queue_rx,
            dispatcher,
        }
    }

    /// Opens a session for the courier at the given position.
    pub(crate) fn connect(
        &self,
        courier_id: &str,
        lat: f64,
        lng: f64,
    ) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.open(courier_id, tx);
        self.registry.upsert_location(courier_id, lat, lng);
        rx
    }

    pub(crate) fn event_kinds(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            kinds.push(event.event);
        }
        kinds
    }

    pub(crate) fn drain_queue(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(id) = self.queue_rx.try_recv() {
            ids.push(id);
        }
        ids
    }
}
