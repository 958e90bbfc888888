use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub orders_in_queue: IntGauge,
    pub active_sessions: IntGauge,
    pub courier_timeouts_total: IntCounter,
    pub tracking_updates_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_total = IntCounterVec::new(
            Opts::new("dispatch_total", "Dispatch attempts by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of one dispatch attempt in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let orders_in_queue = IntGauge::new("orders_in_queue", "Order ids waiting for dispatch")
            .expect("valid orders_in_queue metric");

        let active_sessions = IntGauge::new("active_sessions", "Open courier sessions")
            .expect("valid active_sessions metric");

        let courier_timeouts_total = IntCounter::new(
            "courier_timeouts_total",
            "Busy couriers released by the timeout reaper",
        )
        .expect("valid courier_timeouts_total metric");

        let tracking_updates_total = IntCounter::new(
            "tracking_updates_total",
            "Tracking messages pushed to customers",
        )
        .expect("valid tracking_updates_total metric");

        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("register dispatch_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(courier_timeouts_total.clone()))
            .expect("register courier_timeouts_total");
        registry
            .register(Box::new(tracking_updates_total.clone()))
            .expect("register tracking_updates_total");

        Self {
            registry,
            dispatch_total,
            dispatch_latency_seconds,
            orders_in_queue,
            active_sessions,
            courier_timeouts_total,
            tracking_updates_total,
        }
    }

    pub fn record_dispatch(&self, outcome: &str, elapsed_secs: f64) {
        self.dispatch_total.with_label_values(&[outcome]).inc();
        self.dispatch_latency_seconds
            .with_label_values(&[outcome])
            .observe(elapsed_secs);
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
