use std::fmt;
use std::str::FromStr;

use crate::errors::StreamError;

/// Opaque identifier of a server-side workflow run.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a job id, rejecting empty or whitespace-only values.
    pub fn new(value: impl Into<String>) -> Result<Self, StreamError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(StreamError::Validation("job id must not be empty".into()));
        }
        Ok(Self(value))
    }

    /// Returns the job id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for JobId {
    type Error = StreamError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for JobId {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Transport used to follow a job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `GET /progress/{job}?from={cursor}` on a fixed interval.
    #[default]
    Poll,
    /// One `text/event-stream` response.
    Sse,
    /// One WebSocket connection.
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Sse => "sse",
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" | "http" => Ok(Self::Poll),
            "sse" | "event-stream" => Ok(Self::Sse),
            "socket" | "ws" | "websocket" => Ok(Self::Socket),
            other => Err(StreamError::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Connection state of a session. A session occupies exactly one at a time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    /// Circuit breaker tripped; no further connection attempts.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_rejects_blank_values() {
        assert!(matches!(JobId::new("  "), Err(StreamError::Validation(_))));
        assert_eq!(JobId::new("abc").expect("job id").as_str(), "abc");
    }

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("WS".parse::<TransportKind>().expect("kind"), TransportKind::Socket);
        assert_eq!("sse".parse::<TransportKind>().expect("kind"), TransportKind::Sse);
        assert_eq!("polling".parse::<TransportKind>().expect("kind"), TransportKind::Poll);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
