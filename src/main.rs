use std::sync::Arc;

use courier_dispatch::api;
use courier_dispatch::auth::JwtVerifier;
use courier_dispatch::config::Config;
use courier_dispatch::engine::dispatcher::{run_dispatch_loop, run_signal_loop};
use courier_dispatch::engine::lookup::HttpOrderService;
use courier_dispatch::engine::reaper::TimeoutReaper;
use courier_dispatch::engine::tracking::TrackingPublisher;
use courier_dispatch::error::AppError;
use courier_dispatch::messaging::amqp::{AmqpEventSink, OrderConsumer};
use courier_dispatch::messaging::events::EventLog;
use courier_dispatch::observability::init_tracing;
use courier_dispatch::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    if config.jwt_dev_secret {
        tracing::warn!("JWT_SECRET not set; using the development secret, courier tokens are forgeable");
    }

    let orders = Arc::new(HttpOrderService::new(
        &config.order_service_url,
        config.lookup_timeout,
    )?);

    let mut event_log = EventLog::new(config.event_buffer_size);
    let consumer = match &config.amqp {
        Some(amqp) => {
            let sink = AmqpEventSink::connect(amqp.clone()).await?;
            event_log = event_log.with_sink(Arc::new(sink));
            Some(OrderConsumer::connect(amqp.clone()).await?)
        }
        None => {
            tracing::warn!("AMQP_URL not set; accepting orders over http only");
            None
        }
    };

    let (app_state, order_rx, signal_rx) = AppState::new(
        config.order_queue_size,
        config.archive_size,
        orders,
        Arc::new(event_log),
        Arc::new(JwtVerifier::new(&config.jwt_secret)),
    );
    let shared_state = Arc::new(app_state);

    if let Some(consumer) = consumer {
        tokio::spawn(consumer.run(shared_state.queue.clone()));
    }

    tokio::spawn(run_dispatch_loop(shared_state.dispatcher.clone(), order_rx));
    tokio::spawn(run_signal_loop(shared_state.dispatcher.clone(), signal_rx));

    let reaper = TimeoutReaper::new(
        shared_state.registry.clone(),
        shared_state.dispatcher.clone(),
        shared_state.events.clone(),
        shared_state.metrics.clone(),
        config.reaper_interval,
        config.stale_after,
    );
    tokio::spawn(reaper.run());

    let tracking = TrackingPublisher::new(
        shared_state.registry.clone(),
        shared_state.sessions.clone(),
        shared_state.dispatcher.clone(),
        shared_state.metrics.clone(),
        config.tracking_interval,
    );
    tokio::spawn(tracking.run());

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
