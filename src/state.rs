use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::SubjectVerifier;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::lookup::OrderService;
use crate::engine::queue::OrderQueue;
use crate::messaging::events::EventLog;
use crate::observability::metrics::Metrics;
use crate::registry::CourierRegistry;
use crate::session::{SessionManager, SessionSignal};

pub struct AppState {
    pub registry: Arc<CourierRegistry>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: Arc<EventLog>,
    pub verifier: Arc<dyn SubjectVerifier>,
    pub queue: OrderQueue,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the components together. The receivers belong to the dispatch and
    /// signal loops.
    pub fn new(
        order_queue_size: usize,
        archive_size: usize,
        orders: Arc<dyn OrderService>,
        events: Arc<EventLog>,
        verifier: Arc<dyn SubjectVerifier>,
    ) -> (
        Self,
        mpsc::Receiver<String>,
        mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        let metrics = Metrics::new();
        let registry = Arc::new(CourierRegistry::new());
        let (sessions, signal_rx) = SessionManager::new(registry.clone(), metrics.clone());
        let sessions = Arc::new(sessions);
        let (queue, order_rx) = OrderQueue::new(order_queue_size, metrics.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            sessions.clone(),
            orders,
            events.clone(),
            queue.clone(),
            metrics.clone(),
            archive_size,
        ));

        (
            Self {
                registry,
                sessions,
                dispatcher,
                events,
                verifier,
                queue,
                metrics,
            },
            order_rx,
            signal_rx,
        )
    }
}
