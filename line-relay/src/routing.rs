//! Fan-in/fan-out bookkeeping for multi-way relays.

use std::sync::Arc;

use tokio::sync::{Notify, futures::Notified};

use crate::{error::RelayError, message::Message, queue::BoundedQueue};

/// Source queues of every client session, indexed by client.
///
/// The index of a queue here is the origin index that travels with the
/// client's messages to the server and back.
pub struct RoutingTable {
    queues: Vec<Arc<BoundedQueue>>,
    activity: Arc<Notify>,
}

impl RoutingTable {
    pub fn new(clients: usize, capacity: usize) -> Self {
        let activity = Arc::new(Notify::new());
        let queues = (0..clients)
            .map(|_| Arc::new(BoundedQueue::with_activity(capacity, Arc::clone(&activity))))
            .collect();
        Self { queues, activity }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queue(&self, index: usize) -> Option<&Arc<BoundedQueue>> {
        self.queues.get(index)
    }

    /// Takes at most one message from every non-empty queue, visiting them
    /// in index order.
    pub fn fair_pass(&self) -> Vec<(usize, Message)> {
        self.fair_pass_where(|_| true)
    }

    /// Like [`fair_pass`](Self::fair_pass), but leaves the queues of clients
    /// for which `ready` is false untouched this pass.
    pub fn fair_pass_where(&self, ready: impl Fn(usize) -> bool) -> Vec<(usize, Message)> {
        self.queues
            .iter()
            .enumerate()
            .filter(|(index, _)| ready(*index))
            .filter_map(|(index, queue)| queue.try_dequeue().ok().map(|message| (index, message)))
            .collect()
    }

    /// Resolves once any queue receives a message or closes.
    ///
    /// Enable the returned future before checking the queues so a message
    /// that lands in between is not missed.
    pub fn activity(&self) -> Notified<'_> {
        self.activity.notified()
    }

    /// The signal behind [`activity`](Self::activity), for other parts of
    /// the relay that need to wake the forwarder.
    pub fn activity_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }

    /// True once every queue is closed and empty.
    pub fn is_drained(&self) -> bool {
        self.queues.iter().all(|queue| queue.is_finished())
    }

    pub fn close_all(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }

    /// Picks the client a server response belongs to. Fails closed: a
    /// response without a usable index is never delivered anywhere.
    pub fn route(&self, response: &Message) -> Result<usize, RelayError> {
        let index = response.origin()?;
        if index >= self.queues.len() {
            return Err(RelayError::UnknownOrigin {
                index,
                clients: self.queues.len(),
            });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(table: &RoutingTable, index: usize, messages: &[&str]) {
        let queue = table.queue(index).expect("queue exists");
        for message in messages {
            queue.try_enqueue(Message::from(*message)).expect("room");
        }
    }

    #[test]
    fn one_pass_takes_one_message_per_non_empty_queue() {
        let table = RoutingTable::new(3, 4);
        filled(&table, 0, &["x", "y"]);
        filled(&table, 1, &["z"]);

        let pass = table.fair_pass();
        assert_eq!(pass, vec![(0, Message::from("x")), (1, Message::from("z"))]);

        assert_eq!(table.queue(0).expect("q0").len(), 1);
        assert_eq!(table.queue(0).expect("q0").peek_front().expect("y"), Message::from("y"));
        assert!(table.queue(1).expect("q1").is_empty());
        assert!(table.queue(2).expect("q2").is_empty());
    }

    #[test]
    fn busy_client_cannot_starve_a_quiet_one() {
        let table = RoutingTable::new(2, 8);
        filled(&table, 0, &["a1", "a2", "a3", "a4"]);
        filled(&table, 1, &["b1"]);

        let mut order = Vec::new();
        loop {
            let pass = table.fair_pass();
            if pass.is_empty() {
                break;
            }
            order.extend(pass.into_iter().map(|(_, message)| message.into_string()));
        }
        assert_eq!(order, ["a1", "b1", "a2", "a3", "a4"]);
    }

    #[test]
    fn a_held_back_client_keeps_its_messages() {
        let table = RoutingTable::new(3, 4);
        filled(&table, 0, &["a1", "a2"]);
        filled(&table, 1, &["b1"]);
        filled(&table, 2, &["c1"]);

        let pass = table.fair_pass_where(|index| index != 0);
        assert_eq!(pass, vec![(1, Message::from("b1")), (2, Message::from("c1"))]);
        assert_eq!(table.queue(0).expect("q0").len(), 2);

        assert_eq!(table.fair_pass(), vec![(0, Message::from("a1"))]);
    }

    #[test]
    fn routes_only_to_the_tagged_client() {
        let table = RoutingTable::new(3, 1);
        let forwarded = Message::from("client bob request 0").with_origin(1);
        let reply = Message::new(format!("server response 0 to {forwarded}"));
        assert_eq!(table.route(&reply).expect("routed"), 1);
    }

    #[test]
    fn unroutable_responses_fail_closed() {
        let table = RoutingTable::new(2, 1);

        let missing = table.route(&Message::from("server response 0 to nobody"));
        assert!(matches!(missing, Err(RelayError::MalformedRoutingIndex(_))));

        let out_of_range = table.route(&Message::from("server response 0 to ghost 7"));
        assert!(matches!(
            out_of_range,
            Err(RelayError::UnknownOrigin { index: 7, clients: 2 })
        ));
    }

    #[test]
    fn drained_once_every_queue_is_closed_and_empty() {
        let table = RoutingTable::new(2, 2);
        filled(&table, 1, &["last"]);
        table.close_all();
        assert!(!table.is_drained());

        assert_eq!(table.fair_pass(), vec![(1, Message::from("last"))]);
        assert!(table.is_drained());
    }
}
