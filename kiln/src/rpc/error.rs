use serde::{Deserialize, Serialize};
use std::fmt;

/// An error that crossed the process boundary.
///
/// Arbitrary error types cannot transit the wire, so a capability server
/// flattens whatever its wrapped implementation returned into the message
/// alone before writing it into a reply. On the proxy side the value is
/// re-raised as an ordinary error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicError {
    pub message: String,
}

impl BasicError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<anyhow::Error> for BasicError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the context chain; it names the failing section or step
        Self {
            message: format!("{err:#}"),
        }
    }
}

impl fmt::Display for BasicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BasicError {}
