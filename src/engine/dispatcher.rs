use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::lookup::{validate_details, OrderService};
use crate::engine::queue::OrderQueue;
use crate::error::AppError;
use crate::geo::{haversine_km, GeoPoint};
use crate::messaging::events::EventLog;
use crate::models::courier::CourierSnapshot;
use crate::models::event::DispatchEvent;
use crate::models::message::{AssignmentMessage, OutboundMessage};
use crate::models::order::{DispatchRecord, DispatchStatus, FailureReason, OrderDetails};
use crate::observability::metrics::Metrics;
use crate::registry::CourierRegistry;
use crate::session::{SessionManager, SessionSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Assigned { courier_id: String },
    NoCourier,
    LookupFailed,
    NotConnected,
    Duplicate,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Assigned { .. } => "assigned",
            DispatchOutcome::NoCourier => "no_courier",
            DispatchOutcome::LookupFailed => "lookup_failed",
            DispatchOutcome::NotConnected => "not_connected",
            DispatchOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedCourier {
    pub courier: CourierSnapshot,
    pub distance_km: f64,
}

/// Orders couriers by haversine distance to `origin`, nearest first.
///
/// Couriers at exactly the same distance keep ascending courier-id order, so the
/// result does not depend on how the registry happened to iterate.
pub fn rank_by_distance<I>(origin: &GeoPoint, couriers: I) -> Vec<RankedCourier>
where
    I: IntoIterator<Item = CourierSnapshot>,
{
    let mut ranked: Vec<RankedCourier> = couriers
        .into_iter()
        .filter_map(|courier| {
            let location = courier.record.location?;
            Some(RankedCourier {
                distance_km: haversine_km(origin, &location),
                courier,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.courier.courier_id.cmp(&b.courier.courier_id))
    });
    ranked
}

pub struct Dispatcher {
    registry: Arc<CourierRegistry>,
    sessions: Arc<SessionManager>,
    orders: Arc<dyn OrderService>,
    events: Arc<EventLog>,
    queue: OrderQueue,
    metrics: Metrics,
    records: DashMap<String, DispatchRecord>,
    archive: Mutex<VecDeque<DispatchRecord>>,
    archive_size: usize,
    in_flight: DashSet<String>,
    parked: DashSet<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CourierRegistry>,
        sessions: Arc<SessionManager>,
        orders: Arc<dyn OrderService>,
        events: Arc<EventLog>,
        queue: OrderQueue,
        metrics: Metrics,
        archive_size: usize,
    ) -> Self {
        Self {
            registry,
            sessions,
            orders,
            events,
            queue,
            metrics,
            records: DashMap::new(),
            archive: Mutex::new(VecDeque::new()),
            archive_size,
            in_flight: DashSet::new(),
            parked: DashSet::new(),
        }
    }

    /// Runs one dispatch attempt for an order-ready id. Never fails: every
    /// business outcome ends up in the dispatch record.
    pub async fn on_order_ready(&self, order_id: &str) -> DispatchOutcome {
        if !self.begin(order_id) {
            debug!(order_id, "ignoring duplicate order-ready event");
            self.metrics.record_dispatch(DispatchOutcome::Duplicate.as_str(), 0.0);
            return DispatchOutcome::Duplicate;
        }

        let start = Instant::now();
        let outcome = self.dispatch(order_id).await;
        self.in_flight.remove(order_id);

        self.metrics
            .record_dispatch(outcome.as_str(), start.elapsed().as_secs_f64());
        outcome
    }

    /// Picks the nearest available courier without claiming it.
    pub fn select_nearest_courier(&self, origin: &GeoPoint) -> Option<CourierSnapshot> {
        rank_by_distance(origin, self.registry.list_available())
            .into_iter()
            .next()
            .map(|ranked| ranked.courier)
    }

    /// Claims the courier and pushes the assignment to its session.
    ///
    /// Returns `Conflict` if another dispatch claimed the courier first, and
    /// `NotConnected` after rolling back when the courier has no live session;
    /// in the latter case the order is failed.
    pub async fn assign(
        &self,
        order_id: &str,
        courier_id: &str,
        details: &OrderDetails,
    ) -> Result<(), AppError> {
        if !self.registry.try_mark_busy(courier_id) {
            return Err(AppError::Conflict(format!(
                "courier {courier_id} is no longer available"
            )));
        }

        self.registry.bind_order(order_id, courier_id);

        let message = OutboundMessage::Assignment(AssignmentMessage::new(order_id, details));
        if let Err(err) = self.sessions.send(courier_id, message) {
            self.registry.unbind_courier(courier_id);
            self.registry.set_busy(courier_id, false);
            warn!(order_id, courier_id, error = %err, "assignment rolled back");
            self.fail(order_id, Some(courier_id), FailureReason::NotConnected)
                .await;
            return Err(err);
        }

        self.update_record(order_id, |record| {
            record.status = DispatchStatus::Assigned;
            record.assigned_courier_id = Some(courier_id.to_string());
            record.failure = None;
        });
        self.events
            .emit(DispatchEvent::assigned(order_id, courier_id))
            .await;

        info!(order_id, courier_id, "order assigned");
        Ok(())
    }

    pub async fn on_delivery_confirmed(
        &self,
        courier_id: &str,
        order_id: &str,
    ) -> Result<(), AppError> {
        self.ensure_bound(courier_id, order_id)?;

        self.registry.unbind_courier(courier_id);
        self.registry.set_busy(courier_id, false);

        if let Err(err) = self.orders.mark_delivered(order_id).await {
            error!(order_id, error = %err, "failed to notify order service of delivery");
        }

        self.events
            .emit(DispatchEvent::delivered(order_id, courier_id))
            .await;
        self.update_record(order_id, |record| {
            record.status = DispatchStatus::Delivered;
        });
        self.archive_record(order_id);

        info!(order_id, courier_id, "order delivered");
        self.release_parked().await;
        Ok(())
    }

    pub fn on_pickup_confirmed(&self, courier_id: &str, order_id: &str) -> Result<(), AppError> {
        self.ensure_bound(courier_id, order_id)?;

        self.update_record(order_id, |record| {
            if record.status == DispatchStatus::Assigned {
                record.status = DispatchStatus::Delivering;
            }
        });
        info!(order_id, courier_id, "order picked up");
        Ok(())
    }

    /// Returns a timed-out order to the order-ready input.
    pub async fn requeue_timed_out(&self, order_id: &str) -> Result<(), AppError> {
        self.update_record(order_id, |record| {
            record.status = DispatchStatus::TimedOut;
        });
        self.update_record(order_id, |record| {
            record.status = DispatchStatus::Pending;
            record.assigned_courier_id = None;
        });

        self.queue.enqueue(order_id).await
    }

    /// Resubmits every order that previously found no courier.
    pub async fn release_parked(&self) {
        let parked: Vec<String> = self.parked.iter().map(|id| id.key().clone()).collect();

        for order_id in parked {
            if self.parked.remove(&order_id).is_none() {
                continue;
            }

            debug!(order_id = %order_id, "releasing parked order");
            if let Err(err) = self.queue.enqueue(&order_id).await {
                error!(order_id = %order_id, error = %err, "failed to release parked order");
                self.parked.insert(order_id);
            }
        }
    }

    pub async fn handle_signal(&self, signal: SessionSignal) {
        match signal {
            SessionSignal::CourierOnline { courier_id } => {
                debug!(courier_id = %courier_id, "courier online");
                self.release_parked().await;
            }
            SessionSignal::PickupConfirmed {
                courier_id,
                order_id,
            } => {
                if let Err(err) = self.on_pickup_confirmed(&courier_id, &order_id) {
                    warn!(courier_id = %courier_id, order_id = %order_id, error = %err, "pickup confirmation rejected");
                }
            }
            SessionSignal::DeliveryConfirmed {
                courier_id,
                order_id,
            } => {
                if let Err(err) = self.on_delivery_confirmed(&courier_id, &order_id).await {
                    warn!(courier_id = %courier_id, order_id = %order_id, error = %err, "delivery confirmation rejected");
                }
            }
        }
    }

    /// Live record first, then the archive of finished orders.
    pub fn record(&self, order_id: &str) -> Option<DispatchRecord> {
        if let Some(record) = self.records.get(order_id) {
            return Some(record.value().clone());
        }

        self.archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|record| record.order_id == order_id)
            .cloned()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        let mut records: Vec<DispatchRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        records
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_parked(&self, order_id: &str) -> bool {
        self.parked.contains(order_id)
    }

    async fn dispatch(&self, order_id: &str) -> DispatchOutcome {
        self.parked.remove(order_id);
        self.update_record(order_id, |record| {
            record.status = DispatchStatus::Pending;
            record.assigned_courier_id = None;
            record.failure = None;
            record.attempts += 1;
        });

        let details = match self.resolve(order_id).await {
            Ok(details) => details,
            Err(err) => {
                warn!(order_id, error = %err, "order lookup failed");
                self.fail(order_id, None, FailureReason::LookupFailed).await;
                return DispatchOutcome::LookupFailed;
            }
        };

        let origin = details.pickup();
        for candidate in rank_by_distance(&origin, self.registry.list_available()) {
            let courier_id = candidate.courier.courier_id;
            match self.assign(order_id, &courier_id, &details).await {
                Ok(()) => return DispatchOutcome::Assigned { courier_id },
                Err(AppError::Conflict(_)) => {
                    debug!(order_id, courier_id = %courier_id, "lost courier to a concurrent dispatch");
                }
                Err(_) => return DispatchOutcome::NotConnected,
            }
        }

        warn!(order_id, "no available couriers; parking order");
        self.fail(order_id, None, FailureReason::NoCourier).await;
        DispatchOutcome::NoCourier
    }

    async fn resolve(&self, order_id: &str) -> Result<OrderDetails, AppError> {
        let details = self.orders.order_details(order_id).await?;
        validate_details(&details)?;
        Ok(details)
    }

    async fn fail(&self, order_id: &str, courier_id: Option<&str>, reason: FailureReason) {
        self.update_record(order_id, |record| {
            record.status = DispatchStatus::Failed;
            record.failure = Some(reason);
            record.assigned_courier_id = None;
        });
        self.events
            .emit(DispatchEvent::failed(order_id, courier_id, reason))
            .await;

        if self.archive_record(order_id) {
            return;
        }
        self.parked.insert(order_id.to_string());
    }

    /// Claims the order for this task unless it is already being handled or
    /// already has a courier.
    fn begin(&self, order_id: &str) -> bool {
        if !self.in_flight.insert(order_id.to_string()) {
            return false;
        }

        let duplicate = match self.record(order_id) {
            Some(record) => {
                record.status.is_trackable() || record.status == DispatchStatus::Delivered
            }
            None => false,
        };

        if duplicate {
            self.in_flight.remove(order_id);
        }
        !duplicate
    }

    fn ensure_bound(&self, courier_id: &str, order_id: &str) -> Result<(), AppError> {
        match self.registry.courier_for_order(order_id) {
            Some(bound) if bound == courier_id => Ok(()),
            Some(bound) => Err(AppError::Conflict(format!(
                "order {order_id} is bound to courier {bound}"
            ))),
            None => Err(AppError::NotFound(format!(
                "order {order_id} has no bound courier"
            ))),
        }
    }

    fn update_record(&self, order_id: &str, apply: impl FnOnce(&mut DispatchRecord)) {
        let mut record = self
            .records
            .entry(order_id.to_string())
            .or_insert_with(|| DispatchRecord::pending(order_id));
        apply(record.value_mut());
        record.updated_at = Utc::now();
    }

    /// Moves the record to the archive if it has reached a terminal state.
    fn archive_record(&self, order_id: &str) -> bool {
        let Some((_, record)) = self
            .records
            .remove_if(order_id, |_, record| record.is_terminal())
        else {
            return false;
        };

        let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        archive.push_back(record);
        while archive.len() > self.archive_size {
            archive.pop_front();
        }
        true
    }
}

/// Consumes order-ready ids, one task per order.
pub async fn run_dispatch_loop(dispatcher: Arc<Dispatcher>, mut order_rx: mpsc::Receiver<String>) {
    info!("dispatch loop started");

    while let Some(order_id) = order_rx.recv().await {
        dispatcher.metrics.orders_in_queue.dec();

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.on_order_ready(&order_id).await;
        });
    }

    warn!("dispatch loop stopped: queue channel closed");
}

pub async fn run_signal_loop(
    dispatcher: Arc<Dispatcher>,
    mut signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
) {
    while let Some(signal) = signal_rx.recv().await {
        dispatcher.handle_signal(signal).await;
    }

    warn!("session signal loop stopped");
}
