//! Delivery channel between the scheduler and the consumer.
//!
//! Models the broker contract the pipeline is written against: a durable
//! queue with a single consumer, one message in flight, and explicit
//! ack/nack where a nack drops the message without requeueing it. The
//! broker client itself is outside the pipeline; this bounded in-process
//! queue is the bundled binding and the test transport.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::VigilError;

/// Wire payload published for every new alert mail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertEnvelope {
    /// Which feed produced the alert.
    pub source: String,
    /// Source mailbox message id, hashed downstream for the audit key.
    pub message_id: String,
    pub subject: String,
    pub body: String,
}

/// Create a bounded queue pair. The capacity backpressures the publisher
/// when the consumer falls behind.
pub fn memory_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Publish side of the delivery channel.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl QueueSender {
    /// Serialize and enqueue one envelope. At-least-once from the
    /// publisher's point of view: a crash after this call but before the
    /// scheduler's bookkeeping causes redelivery next cycle.
    pub async fn publish(&self, envelope: &AlertEnvelope) -> Result<(), VigilError> {
        let payload = serde_json::to_vec(envelope)?;
        self.tx
            .send(payload)
            .await
            .map_err(|_| VigilError::QueueClosed)
    }
}

/// Consume side. Single consumer, one delivery at a time.
pub struct QueueReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl QueueReceiver {
    /// Next delivery, or None once every sender is gone.
    pub async fn receive(&mut self) -> Option<Delivery> {
        self.rx.recv().await.map(|payload| Delivery { payload })
    }
}

/// One in-flight message. Must be acked or nacked before the consumer
/// asks for the next one.
pub struct Delivery {
    payload: Vec<u8>,
}

impl Delivery {
    /// Decode the wire payload. Failure here is the consumer's nack path.
    pub fn decode(&self) -> Result<AlertEnvelope, VigilError> {
        serde_json::from_slice(&self.payload).map_err(VigilError::Payload)
    }

    /// Positive acknowledgement; the message is done.
    pub fn ack(self) {
        debug!("delivery acked");
    }

    /// Negative acknowledgement. The message is dropped, not requeued:
    /// a processing failure permanently loses that alert.
    pub fn nack(self) {
        debug!("delivery nacked (dropped, no requeue)");
    }
}
