use std::io;

/// Failures surfaced by the relay core.
///
/// Queue conditions (`QueueFull`, `QueueEmpty`) are recoverable and are
/// handed to the overflow policy or the caller's retry logic. Connection
/// conditions decide whether a session retries, drains, or faults.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("queue is full")]
    QueueFull,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("no message arrived before the read deadline")]
    ReadTimeout,

    #[error("response carries no valid origin index: {0:?}")]
    MalformedRoutingIndex(String),

    #[error("origin index {index} does not name one of {clients} client sessions")]
    UnknownOrigin { index: usize, clients: usize },

    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Errors worth retrying after a cooldown under the tolerant policy.
    ///
    /// End of stream is not transient: a closed connection never yields
    /// another message, so the session drains instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::QueueFull | RelayError::ReadTimeout | RelayError::Io(_)
        )
    }
}
