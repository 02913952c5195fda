//! Error taxonomy for the relay.
//!
//! None of these ever reach the platform as an HTTP error: backend failures
//! collapse to "no answer" inside the responders, and guard denials are
//! turned into a reply text by the dispatcher.

use std::fmt;
use std::time::Duration;

/// Which rate window tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Burst,
    Minute,
    Hour,
    Day,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::Burst => "burst",
            LimitKind::Minute => "minute",
            LimitKind::Hour => "hour",
            LimitKind::Day => "day",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("backend credentials are not configured")]
    MissingCredentials,
    #[error("empty utterance")]
    EmptyInput,
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("backend call timed out")]
    Timeout,
    #[error("backend answered with status {0}")]
    NonSuccessStatus(u16),
    #[error("backend response could not be parsed")]
    UnparsableResponse,
    #[error("rate limited ({0})")]
    RateLimited(LimitKind),
    #[error("banned for another {}s", .0.as_secs())]
    Banned(Duration),
    #[error("counter store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Short machine-readable kind used in diagnostics and log fields.
    pub fn kind(&self) -> String {
        match self {
            RelayError::MissingCredentials => "missing-credentials".into(),
            RelayError::EmptyInput => "empty-input".into(),
            RelayError::Transport(_) => "transport-error".into(),
            RelayError::Timeout => "timeout".into(),
            RelayError::NonSuccessStatus(code) => format!("http-status:{}", code),
            RelayError::UnparsableResponse => "unparsable-response".into(),
            RelayError::RateLimited(kind) => format!("rate-limited:{}", kind),
            RelayError::Banned(_) => "banned".into(),
            RelayError::Store(_) => "store-error".into(),
        }
    }
}
