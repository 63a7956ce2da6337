use crate::errors::{SessionFailure, StreamError};

/// Kind of a workflow progress event as sent on the wire.
///
/// Kinds the client does not know are kept verbatim in `Other` so callers can
/// still render them.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Ready,
    Connected,
    Heartbeat,
    AgentStart,
    AgentComplete,
    IterationStart,
    Refinement,
    Complete,
    Error,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::AgentStart => "agent_start",
            Self::AgentComplete => "agent_complete",
            Self::IterationStart => "iteration_start",
            Self::Refinement => "refinement",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Other(kind) => kind,
        }
    }

    /// `complete` and `error` end a session's logical stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Transport-level kinds that are never handed to subscribers.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ready | Self::Connected | Self::Heartbeat)
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ready" => Self::Ready,
            "connected" => Self::Connected,
            "heartbeat" => Self::Heartbeat,
            "agent_start" => Self::AgentStart,
            "agent_complete" => Self::AgentComplete,
            "iteration_start" => Self::IterationStart,
            "refinement" => Self::Refinement,
            "complete" => Self::Complete,
            "error" => Self::Error,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventKind> for String {
    fn from(value: EventKind) -> Self {
        match value {
            EventKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event of a workflow run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamEvent {
    /// Transport-local sequence number, when the server sends one.
    #[serde(default, alias = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Read from `kind` or, for SSE/WebSocket frames, `type`.
    #[serde(alias = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
}

impl StreamEvent {
    /// Creates an event with no sequence, agent, message or payload.
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            sequence: None,
            kind: kind.into(),
            agent: None,
            message: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Failure text carried by an `error` event.
    pub(crate) fn failure_message(&self) -> String {
        if let Some(message) = self.message.as_deref().filter(|m| !m.trim().is_empty()) {
            return message.to_string();
        }
        ["error", "message"]
            .iter()
            .find_map(|key| self.payload.get(key).and_then(|v| v.as_str()))
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "workflow failed".to_string())
    }
}

/// Terminal value of a session, set at most once.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SessionOutcome {
    /// The server sent `complete`; carries that event.
    Completed(StreamEvent),
    /// The workflow failed or the backend became unreachable.
    Errored(SessionFailure),
    /// The session was cancelled or dropped by its owner.
    Cancelled,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Maps the outcome to the completion event or a `StreamError`.
    pub fn into_result(self) -> Result<StreamEvent, StreamError> {
        match self {
            Self::Completed(event) => Ok(event),
            Self::Errored(failure) => Err(StreamError::Failed(failure)),
            Self::Cancelled => Err(StreamError::Cancelled),
        }
    }
}
