use std::time::Duration;

use tracing::{error, warn};

use crate::{
    connection::MessageReader, error::RelayError, message::Message, queue::BoundedQueue,
};

/// Cooldown applied by the tolerant policy when none is configured.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// What an ingestion task does when its queue is full or its read fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Any full queue or unexpected read error ends the session.
    Strict,
    /// Pause for `cooldown`, then retry the same operation. Never gives up.
    Tolerant { cooldown: Duration },
}

impl OverflowPolicy {
    pub fn tolerant() -> Self {
        OverflowPolicy::Tolerant {
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Puts `message` into `queue`.
    ///
    /// Under the tolerant policy a full queue costs one cooldown per failed
    /// attempt and the same message is offered again; the returned count is
    /// the number of retries that were needed.
    pub async fn admit(
        &self,
        queue: &BoundedQueue,
        message: Message,
        peer: &str,
    ) -> Result<u32, RelayError> {
        let mut message = message;
        let mut retries = 0;
        loop {
            match queue.push(message) {
                Ok(()) => return Ok(retries),
                Err((rejected, RelayError::QueueFull)) => {
                    warn!(peer, size = queue.len(), "queue full, message not admitted");
                    match self {
                        OverflowPolicy::Strict => {
                            error!(peer, payload = %rejected, "giving up on full queue");
                            return Err(RelayError::QueueFull);
                        }
                        OverflowPolicy::Tolerant { cooldown } => {
                            tokio::time::sleep(*cooldown).await;
                            retries += 1;
                            message = rejected;
                        }
                    }
                }
                Err((_, err)) => return Err(err),
            }
        }
    }

    /// Reads the next message, applying the policy to transient failures.
    ///
    /// End of stream is always returned to the caller.
    pub async fn read(
        &self,
        reader: &mut MessageReader,
        peer: &str,
    ) -> Result<Message, RelayError> {
        loop {
            let err = match reader.read_message().await {
                Ok(message) => return Ok(message),
                Err(RelayError::ConnectionClosed) => return Err(RelayError::ConnectionClosed),
                Err(err) => err,
            };

            warn!(peer, error = %err, "read failed");
            match self {
                OverflowPolicy::Tolerant { cooldown } if err.is_transient() => {
                    tokio::time::sleep(*cooldown).await;
                }
                _ => return Err(err),
            }
        }
    }
}
