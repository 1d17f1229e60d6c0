use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted by the payment services after a state change commits.
/// Consumers (notification senders, projections) subscribe to the channel;
/// delivery is best-effort and never blocks a payment operation's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    PaymentInitiated {
        payment_id: i64,
        user_id: i64,
    },
    PaymentCompleted {
        payment_id: i64,
        transaction_id: String,
    },
    PaymentFailed {
        payment_id: i64,
        reason: String,
    },
    PaymentRefunded {
        payment_id: i64,
    },
    PaymentCancelled {
        payment_id: i64,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates the event channel pair used to wire services to consumers.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_through_the_channel() {
        let (sender, mut rx) = event_channel(8);

        sender
            .send(Event::PaymentCancelled { payment_id: 3 })
            .await
            .unwrap();

        match rx.recv().await {
            Some(Event::PaymentCancelled { payment_id }) => assert_eq!(payment_id, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (sender, rx) = event_channel(1);
        drop(rx);

        assert!(sender
            .send(Event::PaymentRefunded { payment_id: 1 })
            .await
            .is_err());
    }
}
