use std::time::Duration;

/// Failures surfaced by the session engine.
///
/// A missing project or session is not an error; lookups return `None`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Transport-level failure (connect refused, DNS, reset, 5xx while the
    /// server is starting). Retryable.
    #[error("{uri} is unreachable: {reason}")]
    Unreachable { uri: String, reason: String },

    /// The server answered but its version is missing, unparsable or too old.
    #[error("{uri} reports version '{version}', the minimum supported version is {minimum}")]
    IncompatibleVersion {
        uri: String,
        version: String,
        minimum: u32,
    },

    /// Malformed or unexpected payload.
    #[error("protocol error from {uri}: {detail}")]
    Protocol { uri: String, detail: String },

    /// A bounded wait ran out.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("already connected to {0}")]
    DuplicateSession(String),

    #[error("invalid server URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("session {0} is closed")]
    Closed(String),
}

impl SyncError {
    /// Whether a later attempt can reasonably succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    pub(crate) fn unreachable(uri: impl ToString, reason: impl ToString) -> Self {
        Self::Unreachable {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn protocol(uri: impl ToString, detail: impl ToString) -> Self {
        Self::Protocol {
            uri: uri.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_and_timeout_are_retryable() {
        assert!(SyncError::unreachable("http://h:1/", "refused").is_retryable());
        assert!(SyncError::Timeout {
            what: "event channel",
            after: Duration::from_millis(10),
        }
        .is_retryable());
    }

    #[test]
    fn other_failures_are_fatal() {
        let incompatible = SyncError::IncompatibleVersion {
            uri: "http://h:1/".into(),
            version: "1700".into(),
            minimum: 1809,
        };
        assert!(!incompatible.is_retryable());
        assert!(!SyncError::protocol("http://h:1/", "bad json").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::InvalidUri {
            uri: "nope".into(),
            reason: "relative URL without a base".into(),
        }
        .is_retryable());
    }

    #[test]
    fn incompatible_version_message_names_both_versions() {
        let e = SyncError::IncompatibleVersion {
            uri: "http://h:1/".into(),
            version: "1700".into(),
            minimum: 1809,
        };
        let msg = e.to_string();
        assert!(msg.contains("1700"));
        assert!(msg.contains("1809"));
    }
}
