use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Domain events emitted after a state change commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    OrderPaid(Uuid),
    OrderPaymentFailed(Uuid),
    OrderShipped(Uuid),
    OrderCompleted(Uuid),
    OrderRefundRequested(Uuid),
    OrderRefunded(Uuid),
    OrderAutoCancelled(Uuid),
    PaymentIntentCreated { order_id: Uuid, trade_no: String },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Background consumer draining the in-process event channel. Events are
/// observability hooks; nothing in the order workflow depends on them.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated(id) => info!(order_id = %id, "event: order created"),
            Event::OrderCancelled(id) => info!(order_id = %id, "event: order cancelled"),
            Event::OrderPaid(id) => info!(order_id = %id, "event: order paid"),
            Event::OrderPaymentFailed(id) => info!(order_id = %id, "event: payment failed"),
            Event::OrderShipped(id) => info!(order_id = %id, "event: order shipped"),
            Event::OrderCompleted(id) => info!(order_id = %id, "event: order completed"),
            Event::OrderRefundRequested(id) => info!(order_id = %id, "event: refund requested"),
            Event::OrderRefunded(id) => info!(order_id = %id, "event: order refunded"),
            Event::OrderAutoCancelled(id) => info!(order_id = %id, "event: order auto-cancelled"),
            Event::PaymentIntentCreated { order_id, trade_no } => {
                info!(order_id = %order_id, trade_no = %trade_no, "event: payment intent created")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender.send(Event::OrderCreated(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderCreated(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender.send(Event::OrderPaid(Uuid::new_v4())).await.is_err());
    }
}
