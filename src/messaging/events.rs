use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::error::AppError;
use crate::models::event::DispatchEvent;

/// Durable destination for dispatch events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DispatchEvent) -> Result<(), AppError>;
}

/// Fans dispatch events out to in-process subscribers and every durable sink.
pub struct EventLog {
    tx: broadcast::Sender<DispatchEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventLog {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer_size);
        Self {
            tx,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Publishes to every destination. A failing sink is logged and skipped.
    pub async fn emit(&self, event: DispatchEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.publish(&event).await {
                error!(
                    error = %err,
                    event = ?event.event,
                    order_id = %event.order_id,
                    "failed to publish dispatch event"
                );
            }
        }

        if self.tx.send(event).is_err() {
            debug!("no in-process event subscribers");
        }
    }
}
