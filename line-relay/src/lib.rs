//! A line relay that sits between one server and one or more clients.
//!
//! Clients send newline-terminated text requests; the relay buffers them in
//! bounded queues, forwards them to the server and acknowledges them back.
//! Each module focuses on one responsibility:
//!
//! - [`message`] is the unit of transfer plus the acknowledgment text and
//!   origin-index tagging used by multi-way relays.
//! - [`queue`] is the bounded FIFO every session buffers through.
//! - [`connection`] turns byte streams into line readers and writers with a
//!   read deadline.
//! - [`policy`] decides whether a full queue or failed read ends a session
//!   or pauses it.
//! - [`ack`] hands acknowledgments from the forwarding side to the client
//!   writer, one at a time.
//! - [`routing`] holds the per-client queues of a multi-way relay and sends
//!   server responses back to their origin.
//! - [`session`] tracks the lifecycle and counters of one client.
//! - [`engine`] wires all of the above into one- or multi-way relays in sync
//!   or async mode.
//! - [`config`], [`cli`], [`net`], [`client`] and [`server`] make up the
//!   `line-relay` binary.
//!
//! Integration tests drive the engine over in-memory pipes and loopback TCP.

pub mod ack;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod message;
pub mod net;
pub mod policy;
pub mod queue;
pub mod routing;
pub mod server;
pub mod session;
