//! Base types shared by the realtime session client.

use std::fmt;

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the session client.
///
/// Every error raised while connecting is terminal to that connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// The relay could not issue a usable credential
    #[error("Credential request failed: {0}")]
    Credential(String),

    /// SDP offer/answer exchange failed locally or at the relay
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The relay or the provider rejected the call
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// An operation did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Data channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// The operation is not allowed in the current session status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The attempt was superseded by `stop()` or a newer `start()`
    #[error("Session attempt cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No open channel
    #[error("Not connected")]
    NotConnected,
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Serialization(err.to_string())
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Lifecycle of one peer session.
///
/// `Idle → Connecting → Active → Closed`, with `Error` reachable from
/// `Connecting` or `Active`. Only a new `start()` leaves `Closed`/`Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Error,
    Closed,
}

impl SessionStatus {
    /// `Closed` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Error => "error",
            SessionStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RealtimeError::Upstream {
            status: 401,
            message: "bad key".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream error (401): bad key");
        assert_eq!(
            RealtimeError::Timeout("negotiate".into()).to_string(),
            "Operation timed out: negotiate"
        );
    }

    #[test]
    fn test_status_terminal() {
        assert!(SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert_eq!(SessionStatus::default(), SessionStatus::Idle);
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: RealtimeError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, RealtimeError::Serialization(_)));
    }
}
