use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::types::{SystemEvent, SystemInput};

/// Input channel receiver, consumed by the manager.
pub type InputReceiver = mpsc::Receiver<SystemInput>;

#[derive(Debug, thiserror::Error)]
#[error("input channel closed")]
pub struct InputClosed;

/// Input channel sender. Wake loops and external surfaces push messages here.
///
/// Stamps each message with a monotonically increasing `seq` so consumers can
/// observe publication order across producers.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::Sender<SystemInput>,
    seq: Arc<AtomicU64>,
}

/// Create an input channel with the given buffer size.
pub fn channel(buffer: usize) -> (InputSender, InputReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        InputSender {
            tx,
            seq: Arc::new(AtomicU64::new(1)),
        },
        rx,
    )
}

impl InputSender {
    /// Publish a prepared message, returning the assigned sequence number.
    pub async fn publish(&self, mut input: SystemInput) -> Result<u64, InputClosed> {
        let permit = self.tx.reserve().await.map_err(|_| InputClosed)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        input.seq = seq;
        permit.send(input);
        Ok(seq)
    }

    /// Submit user text.
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<u64, InputClosed> {
        self.publish(SystemInput::user(text)).await
    }

    /// Submit a structured system event.
    pub async fn submit_event(
        &self,
        event: SystemEvent,
        text: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<u64, InputClosed> {
        self.publish(SystemInput::system(event, text, payload)).await
    }

    /// Messages buffered and not yet received.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputSource;

    #[tokio::test]
    async fn submit_text_creates_user_input() {
        let (tx, mut rx) = channel(4);
        tx.submit_text("hello").await.unwrap();
        let input = rx.recv().await.unwrap();
        assert_eq!(input.text, "hello");
        assert_eq!(input.source, InputSource::User);
        assert!(input.event.is_none());
    }

    #[tokio::test]
    async fn events_are_sequenced_in_order() {
        let (tx, mut rx) = channel(4);
        let other = tx.clone();
        tx.submit_event(SystemEvent::Idle, "idle", serde_json::Value::Null)
            .await
            .unwrap();
        other
            .submit_event(SystemEvent::CronTrigger, "cron", serde_json::json!({"job_id": "j"}))
            .await
            .unwrap();
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.source, InputSource::System);
        assert!(a.seq < b.seq);
        assert_eq!(b.event, Some(SystemEvent::CronTrigger));
        assert_eq!(b.payload["job_id"], "j");
    }

    #[tokio::test]
    async fn pending_counts_buffered_messages() {
        let (tx, mut rx) = channel(2);
        assert_eq!(tx.pending(), 0);
        tx.submit_text("a").await.unwrap();
        tx.submit_text("b").await.unwrap();
        assert_eq!(tx.pending(), 2);
        rx.recv().await.unwrap();
        assert_eq!(tx.pending(), 1);
    }

    #[tokio::test]
    async fn closed_receiver_is_reported() {
        let (tx, rx) = channel(2);
        drop(rx);
        assert!(tx.submit_text("lost").await.is_err());
    }
}
