//! Single-slot hand-off of acknowledgments from the forwarding task to the
//! task that writes to the client.
//!
//! The slot holds at most one acknowledgment. A forwarder that gets ahead of
//! the client writer either waits for the slot to free up ([`AckSender::post`])
//! or keeps the acknowledgment and tries again later
//! ([`AckSender::try_post`]). Either way acknowledgments reach the client in
//! the order they were posted and none are dropped while both ends are alive.

use std::sync::Arc;

use tokio::sync::{
    Notify,
    mpsc::{self, error::TrySendError},
};

use crate::{error::RelayError, message::Message};

/// Creates the two ends of one session's acknowledgment slot.
pub fn channel() -> (AckSender, AckReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (AckSender { tx }, AckReceiver { rx, freed: None })
}

/// Like [`channel`], but pings `freed` every time the receiver takes an
/// acknowledgment out of the slot.
pub fn channel_with_wake(freed: Arc<Notify>) -> (AckSender, AckReceiver) {
    let (sender, mut receiver) = channel();
    receiver.freed = Some(freed);
    (sender, receiver)
}

#[derive(Clone)]
pub struct AckSender {
    tx: mpsc::Sender<Message>,
}

impl AckSender {
    /// Posts an acknowledgment, waiting while the previous one is still in
    /// the slot. Fails with `Closed` once the receiving side is gone.
    pub async fn post(&self, ack: Message) -> Result<(), RelayError> {
        self.tx.send(ack).await.map_err(|_| RelayError::Closed)
    }

    /// Posts without waiting. An occupied slot fails with `QueueFull` and
    /// hands the acknowledgment back.
    pub fn try_post(&self, ack: Message) -> Result<(), (Message, RelayError)> {
        self.tx.try_send(ack).map_err(|err| match err {
            TrySendError::Full(ack) => (ack, RelayError::QueueFull),
            TrySendError::Closed(ack) => (ack, RelayError::Closed),
        })
    }
}

pub struct AckReceiver {
    rx: mpsc::Receiver<Message>,
    freed: Option<Arc<Notify>>,
}

impl AckReceiver {
    /// Waits for the next acknowledgment. Fails with `Closed` once every
    /// sender is dropped and the slot is empty.
    pub async fn recv(&mut self) -> Result<Message, RelayError> {
        let ack = self.rx.recv().await.ok_or(RelayError::Closed)?;
        if let Some(freed) = &self.freed {
            freed.notify_one();
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acknowledgments_arrive_in_posting_order() {
        let (sender, mut receiver) = channel();
        let poster = tokio::spawn(async move {
            for n in 0..5 {
                sender
                    .post(Message::new(format!("request {n}")).acknowledgment())
                    .await
                    .expect("post");
            }
        });

        for n in 0..5 {
            let ack = receiver.recv().await.expect("ack");
            assert_eq!(
                ack.as_str(),
                format!("request {n} has reached the server successfully")
            );
        }
        poster.await.expect("join");
        assert!(matches!(receiver.recv().await, Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn second_post_waits_for_the_slot() {
        let (sender, mut receiver) = channel();
        sender.post(Message::from("one")).await.expect("first post");

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            sender.post(Message::from("two")),
        )
        .await;
        assert!(second.is_err(), "slot should still be occupied");

        assert_eq!(receiver.recv().await.expect("one"), Message::from("one"));
        sender.post(Message::from("two")).await.expect("second post");
        assert_eq!(receiver.recv().await.expect("two"), Message::from("two"));
    }

    #[tokio::test]
    async fn posting_to_a_departed_client_is_closed() {
        let (sender, receiver) = channel();
        drop(receiver);
        assert!(matches!(
            sender.post(Message::from("lost")).await,
            Err(RelayError::Closed)
        ));
    }

    #[tokio::test]
    async fn try_post_hands_back_while_the_slot_is_taken() {
        let freed = Arc::new(Notify::new());
        let (sender, mut receiver) = channel_with_wake(Arc::clone(&freed));
        sender.try_post(Message::from("one")).expect("empty slot");

        let (kept, err) = sender
            .try_post(Message::from("two"))
            .expect_err("slot is occupied");
        assert_eq!(kept, Message::from("two"));
        assert!(matches!(err, RelayError::QueueFull));

        let woken = freed.notified();
        assert_eq!(receiver.recv().await.expect("one"), Message::from("one"));
        tokio::time::timeout(Duration::from_secs(1), woken)
            .await
            .expect("taking an ack frees the slot");
        sender.try_post(kept).expect("slot freed");

        drop(receiver);
        assert!(matches!(
            sender.try_post(Message::from("three")),
            Err((_, RelayError::Closed))
        ));
    }
}
