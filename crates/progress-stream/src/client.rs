use std::sync::Arc;

use tracing::debug;

use crate::config::StreamConfig;
use crate::errors::StreamError;
use crate::model::{JobId, TransportKind};
use crate::session::StreamSession;
use crate::transport::{TransportAdapter, build_adapter};

/// Entry point for following workflow jobs.
///
/// Cheap to clone; every session created from it shares the same transport
/// adapter (and, for HTTP transports, the same connection pool).
#[derive(Clone)]
pub struct StreamClient {
    config: Arc<StreamConfig>,
    adapter: Arc<dyn TransportAdapter>,
}

impl StreamClient {
    /// Starts a builder for configuring a `StreamClient`.
    pub fn builder() -> StreamClientBuilder {
        StreamClientBuilder::default()
    }

    /// Builds a client from `PROGRESS_STREAM_*` environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::builder().config(StreamConfig::from_env()?).build()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn transport(&self) -> TransportKind {
        self.adapter.kind()
    }

    /// Starts following `job_id`.
    ///
    /// Must be called from within a Tokio runtime; the session's driver task
    /// is spawned on it.
    pub fn session(&self, job_id: impl Into<String>) -> Result<StreamSession, StreamError> {
        let job_id = JobId::new(job_id)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StreamError::Config("StreamClient::session must be called inside a Tokio runtime".into())
        })?;
        debug!(job_id = %job_id, transport = %self.adapter.kind(), "creating session");
        Ok(StreamSession::spawn(
            &runtime,
            job_id,
            self.adapter.clone(),
            &self.config,
        ))
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("base_url", &self.config.base_url)
            .field("transport", &self.adapter.kind())
            .finish()
    }
}

/// Builder used to configure a `StreamClient`.
#[derive(Default)]
pub struct StreamClientBuilder {
    config: Option<StreamConfig>,
    adapter: Option<Arc<dyn TransportAdapter>>,
}

impl StreamClientBuilder {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses a custom adapter instead of the one selected by
    /// `StreamConfig::transport`.
    pub fn transport(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Validates the config and builds the client.
    pub fn build(self) -> Result<StreamClient, StreamError> {
        let Some(config) = self.config else {
            return Err(StreamError::Config("StreamClient requires a config".into()));
        };
        config.validate()?;
        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => build_adapter(&config)?,
        };
        Ok(StreamClient {
            config: Arc::new(config),
            adapter,
        })
    }
}
