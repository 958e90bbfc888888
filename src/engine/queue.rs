use tokio::sync::mpsc;

use crate::error::AppError;
use crate::observability::metrics::Metrics;

/// Single entry point for order-ready ids, whoever produces them.
#[derive(Clone)]
pub struct OrderQueue {
    tx: mpsc::Sender<String>,
    metrics: Metrics,
}

impl OrderQueue {
    pub fn new(capacity: usize, metrics: Metrics) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, metrics }, rx)
    }

    pub async fn enqueue(&self, order_id: &str) -> Result<(), AppError> {
        self.tx
            .send(order_id.to_string())
            .await
            .map_err(|err| AppError::Internal(format!("order queue send failed: {err}")))?;

        self.metrics.orders_in_queue.inc();
        Ok(())
    }
}

/// Extracts an order id from a broker payload: either the bare id as text or a
/// JSON object `{"order_id": ...}` with a string or numeric id.
pub fn parse_order_id(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    if !text.starts_with('{') {
        return Some(text.to_string());
    }

    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("order_id")? {
        serde_json::Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_payload_is_the_id() {
        assert_eq!(parse_order_id(b"42\n").as_deref(), Some("42"));
        assert_eq!(parse_order_id(b"o-17").as_deref(), Some("o-17"));
    }

    #[test]
    fn structured_payload_carries_the_id() {
        assert_eq!(parse_order_id(br#"{"order_id":"o1"}"#).as_deref(), Some("o1"));
        assert_eq!(parse_order_id(br#"{"order_id":7,"event_type":"order_created"}"#).as_deref(), Some("7"));
    }

    #[test]
    fn garbage_payloads_are_rejected() {
        assert!(parse_order_id(b"").is_none());
        assert!(parse_order_id(b"   ").is_none());
        assert!(parse_order_id(br#"{"id":"o1"}"#).is_none());
        assert!(parse_order_id(br#"{"order_id":""}"#).is_none());
        assert!(parse_order_id(b"{broken").is_none());
        assert!(parse_order_id(&[0xff, 0xfe]).is_none());
    }

    #[tokio::test]
    async fn enqueue_delivers_in_order() {
        let (queue, mut rx) = OrderQueue::new(4, Metrics::new());
        queue.enqueue("o1").await.unwrap();
        queue.enqueue("o2").await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("o1"));
        assert_eq!(rx.recv().await.as_deref(), Some("o2"));
    }
}
