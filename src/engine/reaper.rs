use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::engine::dispatcher::Dispatcher;
use crate::messaging::events::EventLog;
use crate::models::event::DispatchEvent;
use crate::observability::metrics::Metrics;
use crate::registry::{now_epoch, CourierRegistry, StaleRelease};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedCourier {
    pub courier_id: String,
    pub order_id: Option<String>,
}

/// Periodically frees couriers stuck busy without any registry write and hands
/// their orders back to dispatch.
pub struct TimeoutReaper {
    registry: Arc<CourierRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventLog>,
    metrics: Metrics,
    interval: Duration,
    stale_after: Duration,
}

impl TimeoutReaper {
    pub fn new(
        registry: Arc<CourierRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<EventLog>,
        metrics: Metrics,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            events,
            metrics,
            interval,
            stale_after,
        }
    }

    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "timeout reaper started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = self.sweep_at(now_epoch()).await;
            if !reaped.is_empty() {
                info!(count = reaped.len(), "timeout sweep released couriers");
            }
        }
    }

    /// One sweep as of `now` (epoch seconds).
    ///
    /// The release of each courier is a single conditional registry write, so a
    /// second sweep, even a concurrent one, never sees the same courier again.
    pub async fn sweep_at(&self, now: i64) -> Vec<ReapedCourier> {
        let threshold = self.stale_after.as_secs() as i64;
        let mut reaped = Vec::new();

        for courier_id in self.registry.stale_busy(now, threshold) {
            let Some(StaleRelease { order_id }) =
                self.registry.release_if_stale(&courier_id, now, threshold)
            else {
                continue;
            };

            self.metrics.courier_timeouts_total.inc();

            match &order_id {
                Some(order_id) => {
                    warn!(courier_id = %courier_id, order_id = %order_id, "courier timed out; requeueing order");
                    if let Err(err) = self.dispatcher.requeue_timed_out(order_id).await {
                        error!(order_id = %order_id, error = %err, "failed to requeue timed-out order");
                    }
                    self.events
                        .emit(DispatchEvent::courier_timeout(order_id, &courier_id))
                        .await;
                }
                None => {
                    warn!(courier_id = %courier_id, "released busy courier with no bound order");
                }
            }

            reaped.push(ReapedCourier {
                courier_id,
                order_id,
            });
        }

        if !reaped.is_empty() {
            self.dispatcher.release_parked().await;
        }
        reaped
    }
}
