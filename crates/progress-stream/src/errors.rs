use crate::model::{JobId, TransportKind};

/// Errors reported by a transport adapter.
///
/// Only `NotYetAvailable` is handled outside the reconnection policy; the
/// session retries it on the normal poll cadence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The job is not registered on the server yet (HTTP 404).
    #[error("job {job_id} is not available yet")]
    NotYetAvailable { job_id: JobId },
    /// Timeout, connection reset, or a failing HTTP status.
    #[error("transient network failure ({transport}): {message}")]
    Transient {
        transport: TransportKind,
        message: String,
        status_code: Option<u16>,
    },
    /// A response or frame could not be understood.
    #[error("protocol error ({transport}): {message}")]
    Protocol {
        transport: TransportKind,
        message: String,
    },
    /// The connection ended before a terminal event was seen.
    #[error("connection closed abnormally ({transport}): {message}")]
    AbnormalClose {
        transport: TransportKind,
        message: String,
        code: Option<u16>,
    },
}

impl TransportError {
    pub fn not_yet_available(job_id: &JobId) -> Self {
        Self::NotYetAvailable {
            job_id: job_id.clone(),
        }
    }

    pub fn transient(
        transport: TransportKind,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Transient {
            transport,
            message: message.into(),
            status_code,
        }
    }

    pub fn protocol(transport: TransportKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            transport,
            message: message.into(),
        }
    }

    pub fn abnormal_close(
        transport: TransportKind,
        message: impl Into<String>,
        code: Option<u16>,
    ) -> Self {
        Self::AbnormalClose {
            transport,
            message: message.into(),
            code,
        }
    }

    pub fn is_not_yet_available(&self) -> bool {
        matches!(self, Self::NotYetAvailable { .. })
    }

    /// Returns the transport that produced this error, when known.
    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            Self::NotYetAvailable { .. } => None,
            Self::Transient { transport, .. }
            | Self::Protocol { transport, .. }
            | Self::AbnormalClose { transport, .. } => Some(*transport),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotYetAvailable { job_id } => format!("job {job_id} is not available yet"),
            Self::Transient { message, .. }
            | Self::Protocol { message, .. }
            | Self::AbnormalClose { message, .. } => message.clone(),
        }
    }
}

/// Terminal failure of a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum SessionFailure {
    /// The server sent an `error` event for the workflow itself.
    #[error("workflow failed: {message}")]
    Workflow { message: String },
    /// The circuit breaker tripped after repeated connection failures.
    #[error("progress server unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Transport error surfaced outside a session.
    #[error(transparent)]
    Transport(TransportError),
    /// The session ended with a failure outcome.
    #[error(transparent)]
    Failed(SessionFailure),
    /// The session was cancelled before it reached an outcome.
    #[error("cancelled")]
    Cancelled,
}

impl From<TransportError> for StreamError {
    fn from(value: TransportError) -> Self {
        StreamError::Transport(value)
    }
}

impl From<SessionFailure> for StreamError {
    fn from(value: SessionFailure) -> Self {
        StreamError::Failed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_cover_every_variant() {
        let job = JobId::new("abc").expect("job");
        let nya = TransportError::not_yet_available(&job);
        assert!(nya.is_not_yet_available());
        assert_eq!(nya.transport(), None);
        assert!(nya.message().contains("abc"));

        let transient = TransportError::transient(TransportKind::Poll, "503", Some(503));
        assert_eq!(transient.transport(), Some(TransportKind::Poll));
        assert_eq!(transient.message(), "503");
        assert!(!transient.is_not_yet_available());
    }

    #[test]
    fn unreachable_failure_is_user_readable() {
        let failure = SessionFailure::Unreachable {
            attempts: 5,
            last_error: "connection refused".into(),
        };
        let err = StreamError::from(failure);
        assert_eq!(
            err.to_string(),
            "progress server unreachable after 5 attempts: connection refused"
        );
    }
}
