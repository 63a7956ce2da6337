use std::time::Duration;

use reqwest::Url;

use crate::errors::StreamError;
use crate::model::{JobId, TransportKind};
use crate::policy::ReconnectSettings;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Configuration for following workflow jobs.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// HTTP(S) base URL of the progress server, e.g. `https://api.example.com`.
    pub base_url: String,
    /// WebSocket base URL. Derived from `base_url` (`http→ws`, `https→wss`)
    /// when unset.
    pub socket_url: Option<String>,
    /// Transport used when the client builds its own adapter.
    pub transport: TransportKind,
    /// Poll cadence; also the retry cadence while a job is not available yet.
    pub poll_interval: Duration,
    /// Connect timeout, and the total timeout of one poll request.
    pub request_timeout: Duration,
    /// Close and reconnect when nothing arrives for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    pub reconnect: ReconnectSettings,
}

impl StreamConfig {
    /// Creates a config with default timings for the given server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            socket_url: None,
            transport: TransportKind::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            reconnect: ReconnectSettings::default(),
        }
    }

    /// Builds a config from `PROGRESS_STREAM_*` environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StreamError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(base_url) = get("PROGRESS_STREAM_BASE_URL") else {
            return Err(StreamError::Config(
                "missing PROGRESS_STREAM_BASE_URL".into(),
            ));
        };
        let mut config = Self::new(base_url.trim());
        if let Some(url) = get("PROGRESS_STREAM_SOCKET_URL") {
            config.socket_url = Some(url.trim().to_string());
        }
        if let Some(kind) = get("PROGRESS_STREAM_TRANSPORT") {
            config.transport = kind.parse()?;
        }
        if let Some(ms) = get("PROGRESS_STREAM_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_u64("PROGRESS_STREAM_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = get("PROGRESS_STREAM_REQUEST_TIMEOUT_MS") {
            config.request_timeout =
                Duration::from_millis(parse_u64("PROGRESS_STREAM_REQUEST_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = get("PROGRESS_STREAM_IDLE_TIMEOUT_MS") {
            let ms = parse_u64("PROGRESS_STREAM_IDLE_TIMEOUT_MS", &ms)?;
            config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = get("PROGRESS_STREAM_BACKOFF_BASE_MS") {
            config.reconnect.base_delay_ms = parse_u64("PROGRESS_STREAM_BACKOFF_BASE_MS", &ms)?;
        }
        if let Some(ms) = get("PROGRESS_STREAM_BACKOFF_MAX_MS") {
            config.reconnect.max_delay_ms = parse_u64("PROGRESS_STREAM_BACKOFF_MAX_MS", &ms)?;
        }
        if let Some(n) = get("PROGRESS_STREAM_MAX_ATTEMPTS") {
            let n = parse_u64("PROGRESS_STREAM_MAX_ATTEMPTS", &n)?;
            config.reconnect.max_attempts = u32::try_from(n).map_err(|_| {
                StreamError::Config(format!("PROGRESS_STREAM_MAX_ATTEMPTS out of range: {n}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn socket_url(mut self, socket_url: impl Into<String>) -> Self {
        self.socket_url = Some(socket_url.into());
        self
    }

    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, settings: ReconnectSettings) -> Self {
        self.reconnect = settings;
        self
    }

    /// Checks URLs and timings; called by `StreamClientBuilder::build`.
    pub fn validate(&self) -> Result<(), StreamError> {
        let base = parse_base(&self.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StreamError::Config(format!(
                "base_url must be http or https, got {}",
                base.scheme()
            )));
        }
        if let Some(socket_url) = &self.socket_url {
            let socket = parse_base(socket_url)?;
            if !matches!(socket.scheme(), "ws" | "wss") {
                return Err(StreamError::Config(format!(
                    "socket_url must be ws or wss, got {}",
                    socket.scheme()
                )));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(StreamError::Config("poll_interval must be greater than 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(StreamError::Config(
                "request_timeout must be greater than 0".into(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(StreamError::Config(
                "reconnect base delay must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// `{base}/progress/{job}?from={cursor}`
    pub fn poll_url(&self, job_id: &JobId, cursor: u64) -> Result<Url, StreamError> {
        let mut url = join_segments(parse_base(&self.base_url)?, &["progress", job_id.as_str()])?;
        url.query_pairs_mut()
            .append_pair("from", &cursor.to_string());
        Ok(url)
    }

    /// `{base}/progress/{job}`
    pub fn sse_url(&self, job_id: &JobId) -> Result<Url, StreamError> {
        join_segments(parse_base(&self.base_url)?, &["progress", job_id.as_str()])
    }

    /// `{socket base}/ws/progress/{job}`
    pub fn socket_url_for(&self, job_id: &JobId) -> Result<Url, StreamError> {
        join_segments(self.socket_base()?, &["ws", "progress", job_id.as_str()])
    }

    /// WebSocket base: `socket_url`, or `base_url` with `http→ws`, `https→wss`.
    pub(crate) fn socket_base(&self) -> Result<Url, StreamError> {
        if let Some(url) = &self.socket_url {
            return parse_base(url);
        }
        let mut url = parse_base(&self.base_url)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            StreamError::Config(format!("cannot derive socket url from {}", self.base_url))
        })?;
        if url.cannot_be_a_base() {
            return Err(StreamError::Config(format!("socket url cannot be a base: {url}")));
        }
        Ok(url)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, StreamError> {
    value
        .trim()
        .parse()
        .map_err(|e| StreamError::Config(format!("{key} must be an integer: {e}")))
}

fn parse_base(raw: &str) -> Result<Url, StreamError> {
    Url::parse(raw.trim()).map_err(|e| StreamError::Config(format!("invalid url {raw:?}: {e}")))
}

fn join_segments(mut url: Url, segments: &[&str]) -> Result<Url, StreamError> {
    let display = url.to_string();
    url.path_segments_mut()
        .map_err(|_| StreamError::Config(format!("url cannot be a base: {display}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
