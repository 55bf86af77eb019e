//! The relay engine: sessions, their tasks, and the supervisor that watches
//! them.
//!
//! Every client gets a session with its own source queue. Depending on the
//! delivery mode a session is served either by one control task that runs
//! the receive/forward/acknowledge cycle serially, or by an ingestion task
//! and a forwarding path that run side by side with acknowledgments flowing
//! through the session's [`ack`](crate::ack) slot. Every session also owns
//! the one task that writes to its client, so when the session ends its
//! connection goes with it.
//!
//! Tasks that talk to the server on behalf of every session (the multi-way
//! fan-out forwarder, server ingestion, the reply demultiplexer) belong to
//! the relay as a whole. A failure there faults every session; a failure in
//! a session's own task faults only that session.

use std::{future::Future, pin::pin, sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use tokio::{
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    task::{AbortHandle, JoinSet},
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    ack::{self, AckReceiver, AckSender},
    config::{DeliveryMode, RelayConfig, Topology},
    connection::{Endpoint, MessageReader, MessageWriter, ServerEndpoint},
    error::RelayError,
    message::Message,
    policy::OverflowPolicy,
    queue::BoundedQueue,
    routing::RoutingTable,
    session::{SessionHandle, SessionReport, SessionState},
};

type SharedServer = Arc<Mutex<ServerLink>>;

pub struct RelayEngine {
    config: RelayConfig,
}

/// Outcome of a relay run, one entry per client session in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub sessions: Vec<SessionReport>,
}

impl RelayReport {
    pub fn session(&self, index: usize) -> Option<&SessionReport> {
        self.sessions.get(index)
    }

    pub fn faulted(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions.iter().filter(|session| session.fault.is_some())
    }
}

impl RelayEngine {
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Relays until every client session has closed.
    pub async fn run(self, clients: Vec<Endpoint>, server: ServerEndpoint) -> Result<RelayReport> {
        self.run_until(clients, server, std::future::pending()).await
    }

    /// Relays until every client session has closed or `shutdown` resolves,
    /// whichever comes first. On shutdown every queue is closed and every
    /// task is cancelled.
    pub async fn run_until<F>(
        self,
        clients: Vec<Endpoint>,
        server: ServerEndpoint,
        shutdown: F,
    ) -> Result<RelayReport>
    where
        F: Future<Output = ()> + Send,
    {
        match self.config.topology {
            Topology::OneWay => ensure!(
                clients.len() == 1,
                "one-way relay needs exactly one client, got {}",
                clients.len()
            ),
            Topology::MultiWay => {
                ensure!(!clients.is_empty(), "multi-way relay needs at least one client");
                ensure!(
                    server.reader.is_some(),
                    "multi-way relay needs a server connection that can reply"
                );
            }
        }

        info!(
            topology = ?self.config.topology,
            mode = ?self.config.mode,
            capacity = self.config.capacity,
            overflow = ?self.config.overflow,
            clients = clients.len(),
            "relay starting"
        );

        let relay = Relay::start(&self.config, clients, server);
        Ok(relay.supervise(shutdown).await)
    }
}

/// The server's inbound direction plus optional pacing between sends.
struct ServerLink {
    writer: MessageWriter,
    pacer: Option<Interval>,
}

impl ServerLink {
    fn new(writer: MessageWriter, send_interval: Option<Duration>) -> Self {
        let pacer = send_interval.map(|period| {
            let mut pacer = tokio::time::interval(period);
            pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacer
        });
        Self { writer, pacer }
    }

    async fn send(&mut self, message: &Message) -> Result<(), RelayError> {
        if let Some(pacer) = &mut self.pacer {
            pacer.tick().await;
        }
        self.writer.write_message(message).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Control,
    Ingest,
    Forward,
    Writer,
    Replies,
    FanOut,
    ServerIngest,
    Demux,
}

enum Scope {
    Session(usize),
    Relay,
}

struct TaskExit {
    scope: Scope,
    role: Role,
    result: Result<(), RelayError>,
}

struct SessionSlot {
    handle: SessionHandle,
    queue: Arc<BoundedQueue>,
    tasks: Vec<AbortHandle>,
    running: usize,
}

struct Relay {
    tasks: JoinSet<TaskExit>,
    sessions: Vec<SessionSlot>,
    shared: Vec<AbortHandle>,
    destination: Option<Arc<BoundedQueue>>,
    shared_stopped: bool,
    cancelled: bool,
}

impl Relay {
    fn start(config: &RelayConfig, clients: Vec<Endpoint>, server: ServerEndpoint) -> Self {
        let policy = config.overflow_policy();
        let read_timeout = config.read_timeout();
        let link = Arc::new(Mutex::new(ServerLink::new(server.writer, config.send_interval())));
        let server_reader = server
            .reader
            .map(|reader| reader.with_read_timeout(read_timeout));

        let mut relay = Relay {
            tasks: JoinSet::new(),
            sessions: Vec::with_capacity(clients.len()),
            shared: Vec::new(),
            destination: None,
            shared_stopped: false,
            cancelled: false,
        };

        let table = match config.topology {
            Topology::OneWay => None,
            Topology::MultiWay => Some(Arc::new(RoutingTable::new(clients.len(), config.capacity))),
        };

        let mut readers = Vec::with_capacity(clients.len());
        let mut acks = Vec::with_capacity(clients.len());
        let mut outboxes = Vec::with_capacity(clients.len());
        for (index, endpoint) in clients.into_iter().enumerate() {
            let queue = table
                .as_ref()
                .and_then(|table| table.queue(index).cloned())
                .unwrap_or_else(|| Arc::new(BoundedQueue::new(config.capacity)));
            let handle = SessionHandle::new(index);

            // The fan-out forwarder never waits on a slot; it needs a nudge
            // once a client writer frees one up.
            let (ack_sender, ack_slot) = match (&table, config.mode) {
                (Some(table), DeliveryMode::Async) => ack::channel_with_wake(table.activity_signal()),
                _ => ack::channel(),
            };
            let (outbox, responses) = mpsc::channel(config.capacity);

            relay.sessions.push(SessionSlot {
                handle: handle.clone(),
                queue,
                tasks: Vec::new(),
                running: 0,
            });
            relay.spawn_session_task(
                index,
                Role::Writer,
                write_client(endpoint.writer, ack_slot, responses, handle),
            );
            readers.push(endpoint.reader.with_read_timeout(read_timeout));
            acks.push(ack_sender);
            outboxes.push(outbox);
        }

        match (table, config.mode) {
            (None, DeliveryMode::Sync) => {
                relay.spawn_sync_sessions(readers, acks, &link, server_reader, false);
            }
            (None, DeliveryMode::Async) => {
                relay.spawn_ingestion(readers, policy);
                for (index, sender) in acks.into_iter().enumerate() {
                    let queue = Arc::clone(&relay.sessions[index].queue);
                    let handle = relay.sessions[index].handle.clone();
                    relay.spawn_session_task(
                        index,
                        Role::Forward,
                        forward(queue, Arc::clone(&link), sender, handle),
                    );
                }
                if let (Some(reader), Some(outbox)) = (server_reader, outboxes.into_iter().next()) {
                    relay.spawn_shared_task(Role::Replies, relay_replies(reader, outbox, policy));
                }
            }
            (Some(table), mode) => {
                if mode == DeliveryMode::Sync {
                    relay.spawn_sync_sessions(readers, acks, &link, None, true);
                } else {
                    relay.spawn_ingestion(readers, policy);
                    let handles = relay.sessions.iter().map(|slot| slot.handle.clone()).collect();
                    relay.spawn_shared_task(
                        Role::FanOut,
                        fan_out(Arc::clone(&table), Arc::clone(&link), acks, handles),
                    );
                }

                let destination = Arc::new(BoundedQueue::new(config.capacity));
                if let Some(reader) = server_reader {
                    relay.spawn_shared_task(
                        Role::ServerIngest,
                        ingest_server(reader, Arc::clone(&destination), policy),
                    );
                }
                relay.spawn_shared_task(
                    Role::Demux,
                    demultiplex(table, Arc::clone(&destination), outboxes),
                );
                relay.destination = Some(destination);
            }
        }

        for slot in &relay.sessions {
            slot.handle.transition(SessionState::Active);
        }
        relay
    }

    fn spawn_sync_sessions(
        &mut self,
        readers: Vec<MessageReader>,
        acks: Vec<AckSender>,
        link: &SharedServer,
        mut replies: Option<MessageReader>,
        tag_origin: bool,
    ) {
        for (index, (reader, acks)) in readers.into_iter().zip(acks).enumerate() {
            let cycle = SyncCycle {
                reader,
                acks,
                queue: Arc::clone(&self.sessions[index].queue),
                link: Arc::clone(link),
                replies: replies.take(),
                origin: tag_origin.then_some(index),
                session: self.sessions[index].handle.clone(),
            };
            self.spawn_session_task(index, Role::Control, cycle.run());
        }
    }

    fn spawn_ingestion(&mut self, readers: Vec<MessageReader>, policy: OverflowPolicy) {
        for (index, reader) in readers.into_iter().enumerate() {
            let queue = Arc::clone(&self.sessions[index].queue);
            self.spawn_session_task(index, Role::Ingest, ingest(reader, queue, policy, index));
        }
    }

    fn spawn_session_task<F>(&mut self, index: usize, role: Role, task: F)
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        let abort = self.tasks.spawn(async move {
            TaskExit {
                scope: Scope::Session(index),
                role,
                result: task.await,
            }
        });
        let slot = &mut self.sessions[index];
        slot.tasks.push(abort);
        slot.running += 1;
    }

    fn spawn_shared_task<F>(&mut self, role: Role, task: F)
    where
        F: Future<Output = Result<(), RelayError>> + Send + 'static,
    {
        let abort = self.tasks.spawn(async move {
            TaskExit {
                scope: Scope::Relay,
                role,
                result: task.await,
            }
        });
        self.shared.push(abort);
    }

    async fn supervise<F>(mut self, shutdown: F) -> RelayReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            if !self.shared_stopped && self.all_sessions_closed() {
                self.stop_shared();
            }

            select! {
                _ = &mut shutdown, if !self.cancelled => {
                    info!("shutdown requested, closing every session");
                    self.cancel_all();
                }
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(exit)) => self.on_exit(exit),
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => {
                        error!(error = %err, "relay task panicked");
                        self.fault_all(&err);
                        self.cancel_all();
                    }
                }
            }
        }

        RelayReport {
            sessions: self.sessions.iter().map(|slot| slot.handle.report()).collect(),
        }
    }

    fn on_exit(&mut self, exit: TaskExit) {
        match exit.scope {
            Scope::Session(index) => self.on_session_exit(index, exit.role, exit.result),
            Scope::Relay => self.on_shared_exit(exit.role, exit.result),
        }
    }

    fn on_session_exit(&mut self, index: usize, role: Role, result: Result<(), RelayError>) {
        let slot = &mut self.sessions[index];
        if slot.handle.state().is_terminal() {
            return;
        }
        slot.running = slot.running.saturating_sub(1);

        match result {
            Ok(()) => {
                debug!(session = index, ?role, "session task finished");
                if matches!(role, Role::Ingest | Role::Control) {
                    slot.handle.transition(SessionState::Draining);
                    slot.queue.close();
                }
                if slot.running == 0 {
                    slot.handle.transition(SessionState::Closed);
                }
            }
            Err(err) => self.fault_session(index, &err),
        }
    }

    fn on_shared_exit(&mut self, role: Role, result: Result<(), RelayError>) {
        match result {
            Ok(()) => debug!(?role, "relay task finished"),
            Err(err) if self.shared_stopped => debug!(?role, error = %err, "relay task stopped"),
            Err(err) => {
                error!(?role, error = %err, "server link failed");
                self.fault_all(&err);
                self.stop_shared();
            }
        }
    }

    fn fault_session(&mut self, index: usize, reason: &dyn std::fmt::Display) {
        let slot = &mut self.sessions[index];
        if slot.handle.state().is_terminal() {
            return;
        }
        slot.handle.fault(reason);
        slot.queue.close();
        for task in slot.tasks.drain(..) {
            task.abort();
        }
        slot.running = 0;
        slot.handle.transition(SessionState::Closed);
    }

    fn fault_all(&mut self, reason: &dyn std::fmt::Display) {
        for index in 0..self.sessions.len() {
            self.fault_session(index, reason);
        }
    }

    fn all_sessions_closed(&self) -> bool {
        self.sessions
            .iter()
            .all(|slot| slot.handle.state().is_terminal())
    }

    fn stop_shared(&mut self) {
        self.shared_stopped = true;
        if let Some(destination) = &self.destination {
            destination.close();
        }
        for task in self.shared.drain(..) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
        for slot in &mut self.sessions {
            slot.queue.close();
            slot.handle.transition(SessionState::Closed);
        }
        self.stop_shared();
        self.tasks.abort_all();
    }
}

/// One serial receive, forward, acknowledge loop.
struct SyncCycle {
    reader: MessageReader,
    acks: AckSender,
    queue: Arc<BoundedQueue>,
    link: SharedServer,
    /// Genuine replies from the server, relayed instead of a synthesized
    /// acknowledgment.
    replies: Option<MessageReader>,
    /// Set in multi-way relays so replies can find their way back.
    origin: Option<usize>,
    session: SessionHandle,
}

impl SyncCycle {
    async fn run(mut self) -> Result<(), RelayError> {
        let index = self.session.index();
        loop {
            let request = match self.reader.read_message().await {
                Ok(request) => request,
                Err(RelayError::ConnectionClosed) => {
                    info!(session = index, "client closed the connection");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            debug!(session = index, "client request received");

            self.queue.try_enqueue(request)?;
            let message = self.queue.try_dequeue()?;

            let outbound = match self.origin {
                Some(origin) => message.with_origin(origin),
                None => message.clone(),
            };
            self.link.lock().await.send(&outbound).await?;
            self.session.record_forwarded();
            debug!(session = index, "request handed to the server");

            let reply = match self.replies.as_mut() {
                Some(replies) => replies.read_message().await?,
                None => message.acknowledgment(),
            };
            self.acks.post(reply).await?;
        }
    }
}

async fn ingest(
    reader: MessageReader,
    queue: Arc<BoundedQueue>,
    policy: OverflowPolicy,
    index: usize,
) -> Result<(), RelayError> {
    let mut reader = reader;
    let peer = format!("client {index}");
    loop {
        let message = match policy.read(&mut reader, &peer).await {
            Ok(message) => message,
            Err(RelayError::ConnectionClosed) => {
                info!(session = index, "client closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        policy.admit(&queue, message, &peer).await?;
        debug!(session = index, size = queue.len(), "enqueued");
    }
}

async fn forward(
    queue: Arc<BoundedQueue>,
    link: SharedServer,
    acks: AckSender,
    session: SessionHandle,
) -> Result<(), RelayError> {
    let index = session.index();
    loop {
        let message = match queue.dequeue().await {
            Ok(message) => message,
            Err(RelayError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };
        link.lock().await.send(&message).await?;
        session.record_forwarded();
        debug!(session = index, "forwarded to the server");

        if acks.post(message.acknowledgment()).await.is_err() {
            debug!(session = index, "client writer gone, acknowledgment dropped");
        }
    }
}

/// The only task that writes to a client. Acknowledgments come through the
/// session's slot, server responses through `responses`.
///
/// Finishes once the acknowledgment side is done, writing out any response
/// that already arrived, and then closes the client's write half.
async fn write_client(
    writer: MessageWriter,
    acks: AckReceiver,
    responses: mpsc::Receiver<Message>,
    session: SessionHandle,
) -> Result<(), RelayError> {
    let mut writer = writer;
    let mut acks = acks;
    let mut responses = Some(responses);
    loop {
        select! {
            ack = acks.recv() => match ack {
                Ok(ack) => {
                    writer.write_message(&ack).await?;
                    session.record_acknowledged();
                }
                Err(_) => break,
            },
            response = next_response(&mut responses), if responses.is_some() => match response {
                Some(response) => writer.write_message(&response).await?,
                None => responses = None,
            },
        }
    }

    if let Some(responses) = responses.as_mut() {
        while let Ok(response) = responses.try_recv() {
            writer.write_message(&response).await?;
        }
    }
    debug!(session = session.index(), "closing client connection");
    writer.shutdown().await
}

async fn next_response(responses: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match responses {
        Some(responses) => responses.recv().await,
        None => None,
    }
}

async fn relay_replies(
    reader: MessageReader,
    outbox: mpsc::Sender<Message>,
    policy: OverflowPolicy,
) -> Result<(), RelayError> {
    let mut reader = reader;
    loop {
        match policy.read(&mut reader, "server").await {
            Ok(reply) => {
                if outbox.send(reply).await.is_err() {
                    debug!("client session closed, no one left to reply to");
                    return Ok(());
                }
            }
            Err(RelayError::ConnectionClosed) => {
                info!("server closed its reply stream");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Round-robin forwarder for multi-way relays.
///
/// Each pass takes at most one message from every non-empty client queue.
/// A client whose acknowledgment slot is still occupied keeps its
/// acknowledgment here and is left out of the following passes until the
/// slot frees up, so a client that stops reading only holds up itself.
/// Once a client's queue is closed and drained its slot is released so the
/// session can finish.
async fn fan_out(
    table: Arc<RoutingTable>,
    link: SharedServer,
    acks: Vec<AckSender>,
    sessions: Vec<SessionHandle>,
) -> Result<(), RelayError> {
    let mut acks: Vec<Option<AckSender>> = acks.into_iter().map(Some).collect();
    let mut pending: Vec<Option<Message>> = vec![None; acks.len()];
    loop {
        let mut activity = pin!(table.activity());
        activity.as_mut().enable();

        for (index, slot) in acks.iter_mut().enumerate() {
            if let Some(ack) = pending[index].take() {
                pending[index] = offer(slot, ack, index);
            }
        }

        let pass = table.fair_pass_where(|index| pending[index].is_none());
        let idle = pass.is_empty();
        for (index, message) in pass {
            link.lock().await.send(&message.with_origin(index)).await?;
            sessions[index].record_forwarded();
            debug!(session = index, "forwarded to the server");
            pending[index] = offer(&mut acks[index], message.acknowledgment(), index);
        }

        for (index, slot) in acks.iter_mut().enumerate() {
            let finished = table.queue(index).is_some_and(|queue| queue.is_finished());
            if finished && pending[index].is_none() {
                *slot = None;
            }
        }

        if idle {
            if table.is_drained() && pending.iter().all(Option::is_none) {
                return Ok(());
            }
            activity.await;
        }
    }
}

/// Hands `ack` to a session's slot without waiting. Returns it when the
/// slot is still occupied; drops it when the client writer is gone.
fn offer(slot: &mut Option<AckSender>, ack: Message, index: usize) -> Option<Message> {
    let sender = slot.as_ref()?;
    match sender.try_post(ack) {
        Ok(()) => None,
        Err((ack, RelayError::QueueFull)) => {
            debug!(session = index, "acknowledgment slot busy, holding client back");
            Some(ack)
        }
        Err(_) => {
            debug!(session = index, "client writer gone, acknowledgment dropped");
            *slot = None;
            None
        }
    }
}

async fn ingest_server(
    reader: MessageReader,
    destination: Arc<BoundedQueue>,
    policy: OverflowPolicy,
) -> Result<(), RelayError> {
    let mut reader = reader;
    loop {
        let response = match policy.read(&mut reader, "server").await {
            Ok(response) => response,
            Err(RelayError::ConnectionClosed) => {
                info!("server closed its reply stream");
                destination.close();
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        policy.admit(&destination, response, "server").await?;
        debug!(size = destination.len(), "server response enqueued");
    }
}

/// Routes server responses to the writer of the client named by their
/// origin index. Never waits on a client: responses that cannot be routed,
/// or that would overflow a client's backlog, are logged and dropped.
async fn demultiplex(
    table: Arc<RoutingTable>,
    destination: Arc<BoundedQueue>,
    outboxes: Vec<mpsc::Sender<Message>>,
) -> Result<(), RelayError> {
    loop {
        let response = match destination.dequeue().await {
            Ok(response) => response,
            Err(RelayError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };

        let index = match table.route(&response) {
            Ok(index) => index,
            Err(err) => {
                error!(error = %err, "dropping unroutable server response");
                continue;
            }
        };

        match outboxes[index].try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = index, "client is not keeping up, server response dropped")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = index, "client session closed, server response dropped")
            }
        }
    }
}
