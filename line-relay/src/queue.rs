//! Fixed-capacity FIFO buffer shared between the tasks of one session.
//!
//! The ring itself lives behind a single `std::sync::Mutex`; the lock is
//! never held across an await point. Tasks that need to wait for room or for
//! an item park on a `tokio::sync::Notify` instead of polling the size.

use std::{
    pin::pin,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::Notify;

use crate::{error::RelayError, message::Message};

pub struct BoundedQueue {
    state: Mutex<Ring>,
    not_empty: Notify,
    not_full: Notify,
    activity: Option<Arc<Notify>>,
}

struct Ring {
    slots: Vec<Option<Message>>,
    front: usize,
    rear: usize,
    size: usize,
    closed: bool,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            front: 0,
            rear: capacity - 1,
            size: 0,
            closed: false,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    fn push(&mut self, message: Message) -> Result<(), Message> {
        if self.is_full() {
            return Err(message);
        }
        self.rear = (self.rear + 1) % self.capacity();
        self.slots[self.rear] = Some(message);
        self.size += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Message> {
        if self.size == 0 {
            return None;
        }
        let message = self.slots[self.front].take();
        self.front = (self.front + 1) % self.capacity();
        self.size -= 1;
        message
    }
}

impl BoundedQueue {
    /// Creates an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Mutex::new(Ring::new(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            activity: None,
        }
    }

    /// Creates a queue that also pings `activity` whenever a message lands
    /// or the queue closes, so one consumer can watch several queues.
    pub fn with_activity(capacity: usize, activity: Arc<Notify>) -> Self {
        Self {
            activity: Some(activity),
            ..Self::new(capacity)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends at the rear, or fails with `QueueFull` leaving the queue
    /// untouched.
    pub fn try_enqueue(&self, message: Message) -> Result<(), RelayError> {
        self.push(message).map_err(|(_, err)| err)
    }

    /// Like [`try_enqueue`](Self::try_enqueue) but hands the message back on
    /// failure so the caller can retry with it.
    pub fn push(&self, message: Message) -> Result<(), (Message, RelayError)> {
        let mut ring = self.lock();
        if ring.closed {
            return Err((message, RelayError::Closed));
        }
        if let Err(message) = ring.push(message) {
            return Err((message, RelayError::QueueFull));
        }
        drop(ring);
        self.not_empty.notify_one();
        if let Some(activity) = &self.activity {
            activity.notify_one();
        }
        Ok(())
    }

    /// Removes from the front, or fails with `QueueEmpty`.
    ///
    /// A closed queue keeps handing out what it still holds and reports
    /// `Closed` once it runs dry.
    pub fn try_dequeue(&self) -> Result<Message, RelayError> {
        let mut ring = self.lock();
        match ring.pop() {
            Some(message) => {
                drop(ring);
                self.not_full.notify_one();
                Ok(message)
            }
            None if ring.closed => Err(RelayError::Closed),
            None => Err(RelayError::QueueEmpty),
        }
    }

    /// Waits until a message is available and removes it.
    ///
    /// Returns `Closed` once the queue has been closed and drained.
    pub async fn dequeue(&self) -> Result<Message, RelayError> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();

            match self.try_dequeue() {
                Err(RelayError::QueueEmpty) => notified.await,
                other => return other,
            }
        }
    }

    /// Waits until there is room and appends the message.
    pub async fn enqueue(&self, message: Message) -> Result<(), RelayError> {
        let mut message = message;
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();

            match self.push(message) {
                Ok(()) => return Ok(()),
                Err((returned, RelayError::QueueFull)) => {
                    message = returned;
                    notified.await;
                }
                Err((_, err)) => return Err(err),
            }
        }
    }

    pub fn peek_front(&self) -> Result<Message, RelayError> {
        let ring = self.lock();
        if ring.size == 0 {
            return Err(RelayError::QueueEmpty);
        }
        ring.slots[ring.front].clone().ok_or(RelayError::QueueEmpty)
    }

    pub fn peek_rear(&self) -> Result<Message, RelayError> {
        let ring = self.lock();
        if ring.size == 0 {
            return Err(RelayError::QueueEmpty);
        }
        ring.slots[ring.rear].clone().ok_or(RelayError::QueueEmpty)
    }

    pub fn len(&self) -> usize {
        self.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.lock().size == 0
    }

    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Stops accepting messages and wakes every waiting producer and
    /// consumer. Messages already queued can still be dequeued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        if let Some(activity) = &self.activity {
            activity.notify_one();
        }
    }

    /// True once the queue is closed and nothing is left to drain.
    pub fn is_finished(&self) -> bool {
        let ring = self.lock();
        ring.closed && ring.size == 0
    }
}
