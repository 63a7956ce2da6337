//! Common imports for typical client usage.
//!
//! Covers what a caller needs to follow a job; adapter authors import from
//! `transport` directly.
pub use crate::{
    CancelHandle, ConnectionState, EventKind, JobId, SessionFailure, SessionOutcome,
    StreamClient, StreamClientBuilder, StreamConfig, StreamError, StreamEvent, StreamSession,
    Subscription, TransportKind,
};
