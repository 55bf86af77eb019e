use std::fmt;

use crate::error::RelayError;

const ACK_SUFFIX: &str = " has reached the server successfully";

/// One relayed payload: a single line of text without its terminator.
///
/// The relay never looks inside a message except to synthesize an
/// acknowledgment and, in multi-way relays, to read or append the trailing
/// origin index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(String);

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Acknowledgment returned to a client once its message was handed to
    /// the server.
    pub fn acknowledgment(&self) -> Message {
        Message(format!("{}{ACK_SUFFIX}", self.0.trim()))
    }

    /// Appends the origin index as the trailing token.
    pub fn with_origin(&self, index: usize) -> Message {
        Message(format!("{} {index}", self.0.trim_end()))
    }

    /// Reads the origin index from the trailing token.
    ///
    /// Only plain decimal digits are accepted; anything else (a missing
    /// token, a sign, a word, an overflowing number) is malformed.
    pub fn origin(&self) -> Result<usize, RelayError> {
        let malformed = || RelayError::MalformedRoutingIndex(self.0.clone());
        let token = self.0.split_whitespace().next_back().ok_or_else(malformed)?;
        if !token.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(malformed());
        }
        token.parse().map_err(|_| malformed())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Self(payload)
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Self(payload.to_string())
    }
}
