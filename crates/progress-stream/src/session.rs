//! One followed job: a driver task plus the handle callers hold.
//!
//! The driver owns the transport handle, the reconnection policy, the
//! sequencer and the completion detector. Callers only see the shared state
//! behind [`StreamSession`], and callbacks always run with that state
//! unlocked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::completion::{CompletionDetector, Detection};
use crate::config::StreamConfig;
use crate::errors::{SessionFailure, TransportError};
use crate::event::{SessionOutcome, StreamEvent};
use crate::model::{ConnectionState, JobId, TransportKind};
use crate::policy::{ReconnectDecision, ReconnectionPolicy, RetryState};
use crate::sequencer::EventSequencer;
use crate::transport::{CloseReason, TransportAdapter, TransportEvent, TransportHandle};

type EventCallback = Box<dyn Fn(&StreamEvent) + Send + Sync>;
type OutcomeCallback = Box<dyn FnOnce(&SessionOutcome) + Send>;
type ReadyCallback = Box<dyn FnOnce() + Send>;

struct Subscriber {
    id: u64,
    on_event: EventCallback,
    on_outcome: Mutex<Option<OutcomeCallback>>,
    active: AtomicBool,
}

struct Inner {
    next_id: u64,
    subscribers: Vec<Arc<Subscriber>>,
    ready_callbacks: Vec<(u64, ReadyCallback)>,
    state: ConnectionState,
    retry: RetryState,
    cursor: u64,
    ready: bool,
    outcome: Option<SessionOutcome>,
}

struct Shared {
    session_id: uuid::Uuid,
    job_id: JobId,
    transport: TransportKind,
    inner: Mutex<Inner>,
    cancelled: AtomicBool,
    generation: AtomicU64,
    cancel_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(&self, state: ConnectionState, retry: RetryState) {
        let mut inner = self.lock();
        // A settled session keeps the state it finished in.
        if inner.outcome.is_some() {
            return;
        }
        inner.state = state;
        inner.retry = retry;
    }

    fn set_cursor(&self, cursor: u64) {
        self.lock().cursor = cursor;
    }

    fn dispatch(&self, generation: u64, event: &StreamEvent) {
        let subscribers = {
            let inner = self.lock();
            if self.is_stale(generation) {
                return;
            }
            inner.subscribers.clone()
        };
        for subscriber in subscribers {
            if self.is_stale(generation) {
                debug!(session_id = %self.session_id, "dropping stale delivery");
                return;
            }
            if subscriber.active.load(Ordering::SeqCst) {
                (subscriber.on_event)(event);
            }
        }
    }

    fn fire_ready(&self, generation: u64) {
        let callbacks = {
            let mut inner = self.lock();
            if self.is_stale(generation) {
                return;
            }
            inner.ready = true;
            std::mem::take(&mut inner.ready_callbacks)
        };
        info!(session_id = %self.session_id, job_id = %self.job_id, "workflow ready");
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Records the outcome and delivers it to every subscriber. Returns
    /// `false` when an outcome was already recorded.
    fn finish(&self, outcome: SessionOutcome, state: ConnectionState) -> bool {
        let subscribers = {
            let mut inner = self.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            inner.state = state;
            inner.ready_callbacks.clear();
            std::mem::take(&mut inner.subscribers)
        };
        info!(
            session_id = %self.session_id,
            job_id = %self.job_id,
            outcome = ?outcome,
            "session settled"
        );
        for subscriber in subscribers {
            subscriber.active.store(false, Ordering::SeqCst);
            let callback = subscriber
                .on_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(callback) = callback {
                callback(&outcome);
            }
        }
        self.outcome_tx.send_replace(Some(outcome));
        true
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_tx.send_replace(true);
        if self.finish(SessionOutcome::Cancelled, ConnectionState::Closed) {
            info!(session_id = %self.session_id, job_id = %self.job_id, "session cancelled");
        }
    }

    fn is_registered(&self, key: SubscriptionKey) -> bool {
        let inner = self.lock();
        match key {
            SubscriptionKey::Events(id) => inner
                .subscribers
                .iter()
                .any(|subscriber| subscriber.id == id && subscriber.active.load(Ordering::SeqCst)),
            SubscriptionKey::Ready(id) => inner.ready_callbacks.iter().any(|(other, _)| *other == id),
        }
    }

    fn unsubscribe(&self, key: SubscriptionKey) {
        let mut inner = self.lock();
        match key {
            SubscriptionKey::Events(id) => {
                inner.subscribers.retain(|subscriber| {
                    if subscriber.id == id {
                        subscriber.active.store(false, Ordering::SeqCst);
                        false
                    } else {
                        true
                    }
                });
            }
            SubscriptionKey::Ready(id) => inner.ready_callbacks.retain(|(other, _)| *other != id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SubscriptionKey {
    Events(u64),
    Ready(u64),
}

/// Registration returned by [`StreamSession::subscribe`] and
/// [`StreamSession::on_ready`].
///
/// Dropping it unsubscribes. Disposing from inside one of its own callbacks is
/// allowed.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    shared: Weak<Shared>,
    key: Option<SubscriptionKey>,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            shared: Weak::new(),
            key: None,
        }
    }

    pub fn dispose(mut self) {
        self.release();
    }

    /// `false` once disposed, once the session settled, or when the callback
    /// was already replayed.
    pub fn is_active(&self) -> bool {
        let (Some(key), Some(shared)) = (self.key, self.shared.upgrade()) else {
            return false;
        };
        shared.is_registered(key)
    }

    fn release(&mut self) {
        if let Some(key) = self.key.take()
            && let Some(shared) = self.shared.upgrade()
        {
            shared.unsubscribe(key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cancels a session from anywhere; cloneable and idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// A followed job.
///
/// Created by [`crate::StreamClient::session`]. Dropping the session cancels
/// it.
pub struct StreamSession {
    shared: Arc<Shared>,
}

impl StreamSession {
    /// Spawns the driver task on `runtime`.
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        job_id: JobId,
        adapter: Arc<dyn TransportAdapter>,
        config: &StreamConfig,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        let reconnect = config.reconnect.clone();
        let shared = Arc::new(Shared {
            session_id: uuid::Uuid::new_v4(),
            job_id,
            transport: adapter.kind(),
            inner: Mutex::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
                ready_callbacks: Vec::new(),
                state: ConnectionState::Idle,
                retry: ReconnectionPolicy::new(reconnect.clone()).retry_state(),
                cursor: 0,
                ready: false,
                outcome: None,
            }),
            cancelled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            cancel_tx,
            outcome_tx,
        });
        info!(
            session_id = %shared.session_id,
            job_id = %shared.job_id,
            transport = %shared.transport,
            "starting progress session"
        );

        let driver = Driver {
            shared: shared.clone(),
            adapter,
            cancel_rx,
            poll_interval: config.poll_interval,
            idle_timeout: config.idle_timeout,
            policy: ReconnectionPolicy::new(reconnect),
            sequencer: EventSequencer::new(),
            detector: CompletionDetector::new(),
        };
        runtime.spawn(driver.run());
        Self { shared }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.shared.session_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    pub fn transport(&self) -> TransportKind {
        self.shared.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn retry_state(&self) -> RetryState {
        self.shared.lock().retry
    }

    /// Server-side entries consumed so far.
    pub fn cursor(&self) -> u64 {
        self.shared.lock().cursor
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().ready
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.lock().outcome.clone()
    }

    /// Registers callbacks for progress events and for the outcome.
    ///
    /// The terminal event itself reaches `on_event` before `on_outcome` runs.
    /// When the session has already settled, `on_outcome` runs immediately
    /// and the returned subscription is inactive.
    pub fn subscribe<E, O>(&self, on_event: E, on_outcome: O) -> Subscription
    where
        E: Fn(&StreamEvent) + Send + Sync + 'static,
        O: FnOnce(&SessionOutcome) + Send + 'static,
    {
        let outcome = {
            let mut inner = self.shared.lock();
            match inner.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.subscribers.push(Arc::new(Subscriber {
                        id,
                        on_event: Box::new(on_event),
                        on_outcome: Mutex::new(Some(Box::new(on_outcome))),
                        active: AtomicBool::new(true),
                    }));
                    return Subscription {
                        shared: Arc::downgrade(&self.shared),
                        key: Some(SubscriptionKey::Events(id)),
                    };
                }
            }
        };
        on_outcome(&outcome);
        Subscription::inert()
    }

    /// Runs `callback` once, when the server reports that real events begin.
    /// Runs it immediately if that already happened.
    pub fn on_ready<F>(&self, callback: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.shared.lock();
            if !inner.ready {
                if inner.outcome.is_some() {
                    return Subscription::inert();
                }
                inner.next_id += 1;
                let id = inner.next_id;
                inner.ready_callbacks.push((id, Box::new(callback)));
                return Subscription {
                    shared: Arc::downgrade(&self.shared),
                    key: Some(SubscriptionKey::Ready(id)),
                };
            }
        }
        callback();
        Subscription::inert()
    }

    /// Stops the session. Safe to call repeatedly; no callback starts after
    /// the first call returns.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Waits for the outcome.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.shared.outcome_tx.subscribe();
        let settled = rx.wait_for(Option::is_some).await;
        match settled {
            Ok(outcome) => outcome.clone().unwrap_or(SessionOutcome::Cancelled),
            Err(_) => SessionOutcome::Cancelled,
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.shared.session_id)
            .field("job_id", &self.shared.job_id)
            .field("transport", &self.shared.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// How one open connection ended.
enum PumpEnd {
    Settled,
    Cancelled,
    Closed(CloseReason),
}

enum Next {
    Event(Option<TransportEvent>),
    Idle(Duration),
}

struct Driver {
    shared: Arc<Shared>,
    adapter: Arc<dyn TransportAdapter>,
    cancel_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    idle_timeout: Option<Duration>,
    policy: ReconnectionPolicy,
    sequencer: EventSequencer,
    detector: CompletionDetector,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.shared.is_cancelled() {
                break;
            }
            self.policy.on_connecting();
            self.shared
                .set_state(ConnectionState::Connecting, self.policy.retry_state());

            let cursor = self.sequencer.cursor();
            debug!(
                session_id = %self.shared.session_id,
                job_id = %self.shared.job_id,
                transport = %self.shared.transport,
                cursor,
                "opening transport"
            );
            let opened = tokio::select! {
                _ = cancelled(&mut self.cancel_rx) => break,
                opened = self.adapter.open(&self.shared.job_id, cursor) => opened,
            };

            let handle = match opened {
                Ok(handle) => handle,
                Err(err) if err.is_not_yet_available() => {
                    debug!(
                        session_id = %self.shared.session_id,
                        job_id = %self.shared.job_id,
                        "job not available yet; retrying at poll cadence"
                    );
                    if !self.sleep(self.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    let decision = self.policy.on_failure();
                    if !self.follow(decision, err.to_string()).await {
                        break;
                    }
                    continue;
                }
            };

            self.policy.on_open();
            let generation = self.shared.next_generation();
            self.shared
                .set_state(ConnectionState::Open, self.policy.retry_state());
            info!(
                session_id = %self.shared.session_id,
                job_id = %self.shared.job_id,
                transport = %self.shared.transport,
                cursor,
                "transport open"
            );

            match self.pump(handle, generation).await {
                PumpEnd::Settled | PumpEnd::Cancelled => break,
                PumpEnd::Closed(reason) => {
                    self.shared
                        .set_state(ConnectionState::Closed, self.policy.retry_state());
                    let reason = match reason {
                        CloseReason::Normal => CloseReason::Error(TransportError::abnormal_close(
                            self.shared.transport,
                            "connection closed before a terminal event",
                            None,
                        )),
                        other => other,
                    };
                    let last_error = reason.describe();
                    warn!(
                        session_id = %self.shared.session_id,
                        job_id = %self.shared.job_id,
                        transport = %self.shared.transport,
                        reason = %last_error,
                        "transport closed"
                    );
                    let decision = self.policy.on_closed(&reason);
                    if !self.follow(decision, last_error).await {
                        break;
                    }
                }
            }
        }
        debug!(session_id = %self.shared.session_id, "session driver stopped");
    }

    /// Applies a policy decision. Returns `false` when the driver must stop.
    async fn follow(&mut self, decision: ReconnectDecision, last_error: String) -> bool {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                warn!(
                    session_id = %self.shared.session_id,
                    job_id = %self.shared.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "connection failed; backing off"
                );
                self.shared
                    .set_state(ConnectionState::Closed, self.policy.retry_state());
                self.sleep(delay).await
            }
            ReconnectDecision::CircuitOpen { attempts } => {
                warn!(
                    session_id = %self.shared.session_id,
                    job_id = %self.shared.job_id,
                    attempts,
                    error = %last_error,
                    "circuit open; giving up"
                );
                self.shared
                    .set_state(ConnectionState::Failed, self.policy.retry_state());
                let failure = SessionFailure::Unreachable {
                    attempts,
                    last_error,
                };
                self.settle(SessionOutcome::Errored(failure), ConnectionState::Failed);
                false
            }
            ReconnectDecision::Stop => {
                debug!(session_id = %self.shared.session_id, "policy stopped reconnecting");
                false
            }
        }
    }

    fn settle(&mut self, outcome: SessionOutcome, state: ConnectionState) {
        if self.detector.settle(outcome.clone()) {
            self.shared.finish(outcome, state);
        }
    }

    async fn pump(&mut self, mut handle: TransportHandle, generation: u64) -> PumpEnd {
        let idle_timeout = self.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = cancelled(&mut self.cancel_rx) => {
                    handle.close().await;
                    return PumpEnd::Cancelled;
                }
                next = next_event(&mut handle, idle_timeout) => next,
            };

            let event = match next {
                Next::Event(event) => event,
                Next::Idle(after) => {
                    warn!(
                        session_id = %self.shared.session_id,
                        idle_ms = after.as_millis() as u64,
                        "no transport activity; closing"
                    );
                    handle.close().await;
                    return PumpEnd::Closed(CloseReason::Timeout(after));
                }
            };

            match event {
                Some(TransportEvent::Frame(frame)) => {
                    let batch = self.sequencer.accept(frame);
                    self.shared.set_cursor(self.sequencer.cursor());
                    if batch.ready && self.detector.signal_ready() {
                        self.shared.fire_ready(generation);
                    }
                    for event in batch.events {
                        match self.detector.observe(&event) {
                            Detection::Pass => self.shared.dispatch(generation, &event),
                            Detection::Terminal(outcome) => {
                                self.shared.dispatch(generation, &event);
                                self.shared.finish(outcome, ConnectionState::Closed);
                                handle.close().await;
                                return PumpEnd::Settled;
                            }
                            Detection::Discard => {}
                        }
                    }
                }
                Some(TransportEvent::Heartbeat) => {
                    trace!(session_id = %self.shared.session_id, "heartbeat");
                }
                Some(TransportEvent::NotYetAvailable) => {
                    debug!(
                        session_id = %self.shared.session_id,
                        job_id = %self.shared.job_id,
                        "job not available yet"
                    );
                }
                Some(TransportEvent::Closed(reason)) => return PumpEnd::Closed(reason),
                None => {
                    return PumpEnd::Closed(CloseReason::Error(TransportError::abnormal_close(
                        self.shared.transport,
                        "transport ended without a close reason",
                        None,
                    )));
                }
            }
        }
    }

    /// Sleeps unless cancelled first. Returns `false` on cancel.
    async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = cancelled(&mut self.cancel_rx) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

async fn next_event(handle: &mut TransportHandle, idle_timeout: Option<Duration>) -> Next {
    match idle_timeout {
        Some(after) => match tokio::time::timeout(after, handle.next()).await {
            Ok(event) => Next::Event(event),
            Err(_) => Next::Idle(after),
        },
        None => Next::Event(handle.next().await),
    }
}
