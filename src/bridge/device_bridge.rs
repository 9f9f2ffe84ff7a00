//! Async runner for one device bridge
//!
//! Owns the device session and the [`BridgeCore`] state machine. A single
//! task receives commands, session events, adapter results and the retry
//! timer, feeds them to the core one at a time and performs the effects it
//! returns. Nothing else touches the core, so no locking is needed.

use super::machine::{BridgeCore, BridgeEffect, BridgeInput};
use super::state::ConnectionState;
use crate::config::BridgeConfig;
use crate::device::{DeviceIdentity, DeviceSession, SessionError, SessionEvent};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use crate::protocol::StatePayload;
use crate::transport::BusPublisher;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied to session adapter calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Bound for one connect or authenticate call
    pub connect_timeout: Duration,
    /// Bound for one lock/unlock acknowledgement
    pub operation_timeout: Duration,
    /// Bound for releasing the session
    pub disconnect_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl BridgeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.bridge.connect_timeout_secs),
            ..Self::default()
        }
    }
}

/// Where a bridge publishes its state snapshots
pub struct StateOutlet<P: BusPublisher> {
    topic: String,
    publisher: Arc<P>,
    retain: bool,
}

impl<P: BusPublisher> StateOutlet<P> {
    pub fn new(topic: impl Into<String>, publisher: Arc<P>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            publisher,
            retain,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one snapshot; failures are logged and counted, never fatal
    pub async fn publish(&self, payload: &StatePayload) {
        let body = match payload.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Failed to serialize state payload");
                metrics().state_publish_failed();
                return;
            }
        };

        match self.publisher.publish(&self.topic, body, self.retain).await {
            Ok(()) => {
                debug!(topic = %self.topic, state = %payload.lock_current_state, "State published");
                metrics().state_published();
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Failed to publish state");
                metrics().state_publish_failed();
            }
        }
    }
}

/// Handle the supervisor keeps for a running bridge
pub struct BridgeHandle {
    id: String,
    commands: mpsc::UnboundedSender<Bytes>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a raw command payload for the bridge
    pub fn handle_command(&self, payload: Bytes) -> BridgeResult<()> {
        self.commands
            .send(payload)
            .map_err(|_| BridgeError::BridgeClosed {
                device: self.id.clone(),
            })
    }

    /// Sender feeding the bridge's command queue
    pub fn commands(&self) -> mpsc::UnboundedSender<Bytes> {
        self.commands.clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the bridge to close; returns immediately
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the bridge task until `deadline`; aborts it if the deadline
    /// passes. Returns true when the bridge closed on its own.
    pub async fn join_until(&mut self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, &mut self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                if !e.is_cancelled() {
                    error!(device = %self.id, error = %e, "Bridge task failed");
                }
                false
            }
            Err(_) => {
                self.task.abort();
                false
            }
        }
    }
}

/// One lock's bridge task
pub struct DeviceBridge<P: BusPublisher> {
    identity: DeviceIdentity,
    core: BridgeCore,
    session: Arc<dyn DeviceSession>,
    outlet: StateOutlet<P>,
    settings: BridgeSettings,
    state_tx: watch::Sender<ConnectionState>,
    outcome_tx: mpsc::UnboundedSender<BridgeInput>,
    attempt_task: Option<JoinHandle<()>>,
    retry_at: Option<Instant>,
}

impl<P: BusPublisher> DeviceBridge<P> {
    /// Start the bridge task; it begins connecting immediately
    pub fn spawn(
        identity: DeviceIdentity,
        core: BridgeCore,
        session: Arc<dyn DeviceSession>,
        outlet: StateOutlet<P>,
        settings: BridgeSettings,
        cancel: CancellationToken,
    ) -> BridgeHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(core.state());
        let events = session.subscribe();
        let id = identity.id().to_string();

        let bridge = Self {
            identity,
            core,
            session,
            outlet,
            settings,
            state_tx,
            outcome_tx,
            attempt_task: None,
            retry_at: None,
        };

        let span = crate::device_span!(device = %id);
        let task = tokio::spawn(
            bridge
                .run(command_rx, outcome_rx, events, cancel.clone())
                .instrument(span),
        );

        BridgeHandle {
            id,
            commands: command_tx,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Bytes>,
        mut outcomes: mpsc::UnboundedReceiver<BridgeInput>,
        mut events: broadcast::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        info!(address = %self.identity.address(), topic = %self.outlet.topic(), "Bridge started");
        self.apply(BridgeInput::Start).await;
        let mut events_open = true;

        while !self.core.is_finished() {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.apply(BridgeInput::Shutdown).await;
                }
                Some(payload) = commands.recv() => {
                    self.apply(BridgeInput::Command(payload)).await;
                }
                Some(input) = outcomes.recv() => {
                    self.apply(input).await;
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.apply(BridgeInput::Session(event)).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Session event stream closed");
                        events_open = false;
                    }
                },
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.apply(BridgeInput::RetryElapsed).await;
                }
            }
        }

        info!("Bridge stopped");
    }

    /// Feed one input through the core, including any inputs its effects
    /// produce synchronously
    async fn apply(&mut self, input: BridgeInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for effect in self.core.handle(input) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
            let state = self.core.state();
            self.state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
        }
    }

    async fn execute(&mut self, effect: BridgeEffect) -> Option<BridgeInput> {
        match effect {
            BridgeEffect::Connect { attempt } => {
                let session = Arc::clone(&self.session);
                let timeout = self.settings.connect_timeout;
                self.spawn_attempt(async move {
                    let result = bounded(timeout, session.connect(), || {
                        SessionError::ConnectFailed(format!("timed out after {timeout:?}"))
                    })
                    .await;
                    BridgeInput::ConnectFinished { attempt, result }
                });
                None
            }
            BridgeEffect::Authenticate { attempt } => {
                let session = Arc::clone(&self.session);
                let timeout = self.settings.connect_timeout;
                self.spawn_attempt(async move {
                    let result = bounded(timeout, session.authenticate(), || {
                        SessionError::AuthenticationFailed(format!("timed out after {timeout:?}"))
                    })
                    .await;
                    BridgeInput::AuthenticateFinished { attempt, result }
                });
                None
            }
            BridgeEffect::Dispatch { seq, action } => {
                let session = Arc::clone(&self.session);
                let outcome_tx = self.outcome_tx.clone();
                let history_name = self.identity.history_name().to_string();
                let timeout = self.settings.operation_timeout;
                // Not tracked: on shutdown an in-flight operation finishes unobserved
                tokio::spawn(
                    async move {
                        let result = bounded(
                            timeout,
                            session.send_operation(action, &history_name),
                            || SessionError::OperationFailed(format!("no ack after {timeout:?}")),
                        )
                        .await;
                        let _ = outcome_tx.send(BridgeInput::OperationFinished { seq, result });
                    }
                    .in_current_span(),
                );
                None
            }
            BridgeEffect::ScheduleRetry { delay } => {
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            BridgeEffect::CancelRetry => {
                self.retry_at = None;
                None
            }
            BridgeEffect::AbortAttempt => {
                if let Some(task) = self.attempt_task.take() {
                    task.abort();
                }
                None
            }
            BridgeEffect::ReleaseSession => {
                if let Err(e) = self.release_session().await {
                    debug!(error = %e, "Session release before retry failed");
                }
                None
            }
            BridgeEffect::Publish(payload) => {
                self.outlet.publish(&payload).await;
                None
            }
            BridgeEffect::Disconnect => {
                match self.release_session().await {
                    Ok(()) => info!("Session released"),
                    Err(e) => warn!(error = %e, "Session release failed"),
                }
                Some(BridgeInput::Closed)
            }
        }
    }

    fn spawn_attempt<F>(&mut self, attempt: F)
    where
        F: Future<Output = BridgeInput> + Send + 'static,
    {
        if let Some(previous) = self.attempt_task.take() {
            previous.abort();
        }
        let outcome_tx = self.outcome_tx.clone();
        self.attempt_task = Some(tokio::spawn(
            async move {
                let _ = outcome_tx.send(attempt.await);
            }
            .in_current_span(),
        ));
    }

    async fn release_session(&self) -> Result<(), SessionError> {
        let timeout = self.settings.disconnect_timeout;
        bounded(timeout, self.session.disconnect(), || {
            SessionError::DisconnectFailed(format!("timed out after {timeout:?}"))
        })
        .await
    }
}

/// Run a session call with a deadline, mapping expiry to an adapter error
async fn bounded<F>(
    timeout: Duration,
    call: F,
    on_timeout: impl FnOnce() -> SessionError,
) -> Result<(), SessionError>
where
    F: Future<Output = Result<(), SessionError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
