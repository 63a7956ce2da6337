use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::CloseReason;

/// Exponential backoff settings for reconnecting a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Failures tolerated before the circuit breaker opens.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first reconnect.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Exponential multiplier per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed delays.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectSettings {
    pub fn exponential(max_attempts: u32, base_delay_ms: u64, backoff_factor: f64) -> Self {
        let base = if base_delay_ms == 0 {
            default_base_delay_ms()
        } else {
            base_delay_ms
        };
        let factor = if backoff_factor <= 0.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            max_attempts,
            base_delay_ms: base,
            backoff_factor: factor,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms.max(1);
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// `min(base * factor^attempt, max)`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        let raw = (self.base_delay_ms as f64 * exp).round();
        let cap = self.max_delay_ms.max(1);
        let clamped = if raw.is_finite() && raw < cap as f64 {
            raw as u64
        } else {
            cap
        };
        Duration::from_millis(clamped)
    }
}

/// Policy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Connecting,
    Open,
    BackingOff,
    CircuitOpen,
}

/// Snapshot of the retry bookkeeping of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
    pub circuit_open: bool,
}

/// What the session should do after its transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then reopen. `attempt` is the retry number, starting at 1.
    Retry { attempt: u32, delay: Duration },
    /// Too many consecutive failures; stop for good.
    CircuitOpen { attempts: u32 },
    /// The close was requested by the session; nothing to do.
    Stop,
}

/// Decides whether and when to reconnect after a failure.
///
/// The circuit breaker is permanent: once open it stays open until a new
/// session is created.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    settings: ReconnectSettings,
    state: PolicyState,
    retry: RetryState,
}

impl ReconnectionPolicy {
    pub fn new(settings: ReconnectSettings) -> Self {
        let retry = RetryState {
            attempt: 0,
            next_delay: settings.base_delay(),
            circuit_open: false,
        };
        Self {
            settings,
            state: PolicyState::Connecting,
            retry,
        }
    }

    pub fn settings(&self) -> &ReconnectSettings {
        &self.settings
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    pub fn is_circuit_open(&self) -> bool {
        self.retry.circuit_open
    }

    pub fn on_connecting(&mut self) {
        if !self.retry.circuit_open {
            self.state = PolicyState::Connecting;
        }
    }

    /// A connection opened successfully: forget past failures.
    pub fn on_open(&mut self) {
        self.state = PolicyState::Open;
        self.retry = RetryState {
            attempt: 0,
            next_delay: self.settings.base_delay(),
            circuit_open: false,
        };
    }

    pub fn on_closed(&mut self, reason: &CloseReason) -> ReconnectDecision {
        match reason {
            CloseReason::Normal => ReconnectDecision::Stop,
            CloseReason::Error(_) | CloseReason::Timeout(_) => self.on_failure(),
        }
    }

    /// Records a failed `open` or an unexpected close.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.retry.circuit_open {
            return ReconnectDecision::CircuitOpen {
                attempts: self.retry.attempt,
            };
        }
        if self.retry.attempt < self.settings.max_attempts {
            let delay = self.settings.backoff_duration(self.retry.attempt);
            self.retry.attempt += 1;
            self.retry.next_delay = self.settings.backoff_duration(self.retry.attempt);
            self.state = PolicyState::BackingOff;
            return ReconnectDecision::Retry {
                attempt: self.retry.attempt,
                delay,
            };
        }
        self.retry.circuit_open = true;
        self.state = PolicyState::CircuitOpen;
        ReconnectDecision::CircuitOpen {
            attempts: self.retry.attempt,
        }
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(ReconnectSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::model::TransportKind;

    fn failure() -> CloseReason {
        CloseReason::Error(TransportError::transient(
            TransportKind::Socket,
            "reset by peer",
            None,
        ))
    }

    #[test]
    fn backoff_grows_then_opens_circuit() {
        let mut policy = ReconnectionPolicy::default();
        let mut delays = Vec::new();
        for _ in 0..5 {
            match policy.on_closed(&failure()) {
                ReconnectDecision::Retry { delay, .. } => delays.push(delay.as_millis()),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(
            policy.on_closed(&failure()),
            ReconnectDecision::CircuitOpen { attempts: 5 }
        );
        assert_eq!(policy.state(), PolicyState::CircuitOpen);
        assert!(policy.is_circuit_open());
        assert_eq!(
            policy.on_failure(),
            ReconnectDecision::CircuitOpen { attempts: 5 }
        );
    }

    #[test]
    fn delays_are_capped() {
        let settings = ReconnectSettings::exponential(10, 100, 2.0).with_max_delay_ms(250);
        assert_eq!(settings.backoff_duration(0).as_millis(), 100);
        assert_eq!(settings.backoff_duration(1).as_millis(), 200);
        assert_eq!(settings.backoff_duration(2).as_millis(), 250);
        assert_eq!(settings.backoff_duration(400).as_millis(), 250);
    }

    #[test]
    fn open_resets_retry_state() {
        let mut policy = ReconnectionPolicy::default();
        let _ = policy.on_failure();
        let _ = policy.on_failure();
        assert_eq!(policy.retry_state().attempt, 2);
        assert_eq!(policy.retry_state().next_delay, Duration::from_millis(4_000));

        policy.on_open();
        assert_eq!(
            policy.retry_state(),
            RetryState {
                attempt: 0,
                next_delay: Duration::from_millis(1_000),
                circuit_open: false,
            }
        );
        assert_eq!(policy.state(), PolicyState::Open);
    }

    #[test]
    fn normal_close_never_reconnects() {
        let mut policy = ReconnectionPolicy::default();
        policy.on_open();
        assert_eq!(policy.on_closed(&CloseReason::Normal), ReconnectDecision::Stop);
        assert_eq!(policy.retry_state().attempt, 0);
    }

    #[test]
    fn timeout_counts_as_failure() {
        let mut policy = ReconnectionPolicy::default();
        let decision = policy.on_closed(&CloseReason::Timeout(Duration::from_secs(2)));
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1_000)
            }
        );
    }

    #[test]
    fn zero_max_attempts_opens_immediately() {
        let mut policy = ReconnectionPolicy::new(ReconnectSettings::exponential(0, 10, 2.0));
        assert_eq!(
            policy.on_failure(),
            ReconnectDecision::CircuitOpen { attempts: 0 }
        );
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: ReconnectSettings =
            serde_json::from_value(serde_json::json!({"max_attempts": 3})).expect("settings");
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.base_delay_ms, 1_000);
        assert_eq!(settings.max_delay_ms, 30_000);
    }
}
