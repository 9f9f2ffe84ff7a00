//! Impure I/O operations for the MQTT client
//!
//! Owns the rumqttc event loop, reconnects with backoff, re-subscribes and
//! flushes buffered state on every ConnAck, and forwards inbound commands.

use super::connection::{
    configure_mqtt_options, BusConnectionState, Credentials, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::bridge::Backoff;
use crate::config::{BridgeConfig, MqttSection};
use crate::observability::metrics::metrics;
use crate::protocol::InboundMessage;
use crate::transport::{BusPublisher, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);

/// Latest unsent state per topic
type Undelivered = HashMap<String, (Bytes, bool)>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared between the client handle and its event-loop task
#[derive(Clone)]
struct EventLoopContext {
    client: AsyncClient,
    state_tx: watch::Sender<BusConnectionState>,
    subscribed_topics: Arc<StdMutex<Vec<String>>>,
    undelivered: Arc<StdMutex<Undelivered>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    reconnect_config: ReconnectConfig,
}

/// MQTT transport client
pub struct MqttClient {
    context: EventLoopContext,
    event_loop: StdMutex<Option<EventLoop>>,
    event_loop_handle: StdMutex<Option<JoinHandle<()>>>,
    state_rx: watch::Receiver<BusConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    connect_timeout: Duration,
}

impl MqttClient {
    pub fn new(
        config: &MqttSection,
        credentials: Option<Credentials>,
        reconnect_config: ReconnectConfig,
        connect_timeout: Duration,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(config, credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let ((state_tx, state_rx), (shutdown_tx, _)) = Self::setup_connection_channels();

        Ok(Self {
            context: EventLoopContext {
                client,
                state_tx,
                subscribed_topics: Arc::new(StdMutex::new(Vec::new())),
                undelivered: Arc::new(StdMutex::new(HashMap::new())),
                message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
                reconnect_config,
            },
            event_loop: StdMutex::new(Some(event_loop)),
            event_loop_handle: StdMutex::new(None),
            state_rx,
            shutdown_tx,
            started: AtomicBool::new(false),
            connect_timeout,
        })
    }

    /// Client configured from the full bridge configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self, MqttError> {
        Self::new(
            &config.mqtt,
            Credentials::from_config(config),
            ReconnectConfig::from_config(config),
            Duration::from_secs(config.bridge.connect_timeout_secs),
        )
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<BusConnectionState>,
            watch::Receiver<BusConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(BusConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for the first ConnAck with timeout
    ///
    /// Transient disconnects while waiting are tolerated since the event
    /// loop keeps retrying; only a permanent failure ends the wait early.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<BusConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    BusConnectionState::Connected => return Ok(()),
                    BusConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the event loop and wait for the broker to acknowledge
    pub async fn connect(&self) -> Result<(), MqttError> {
        let event_loop = lock(&self.event_loop).take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        self.started.store(true, Ordering::SeqCst);
        metrics().mqtt_connection_attempt();

        let context = self.context.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(
            context
                .run(event_loop, shutdown_rx)
                .instrument(crate::mqtt_span!(task = "event_loop")),
        );
        *lock(&self.event_loop_handle) = Some(handle);

        let connection_timeout = HealthMonitor::calculate_connection_timeout(
            &self.context.reconnect_config,
            self.connect_timeout,
        );
        if let Err(e) =
            Self::wait_for_connection_confirmation(self.state_rx.clone(), connection_timeout).await
        {
            let _ = self.shutdown_tx.send(true);
            return Err(e);
        }
        Ok(())
    }

    /// Subscribe to a topic filter and remember it for re-subscription
    pub async fn subscribe(&self, topic_filter: &str) -> Result<(), MqttError> {
        {
            let mut topics = lock(&self.context.subscribed_topics);
            if !topics.iter().any(|t| t == topic_filter) {
                topics.push(topic_filter.to_string());
            }
        }

        if !self.is_connected() {
            debug!(topic = topic_filter, "Subscription deferred until connected");
            return Ok(());
        }

        info!(topic = topic_filter, "Subscribing");
        self.context
            .client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(
                    format!("Failed to subscribe to {topic_filter}: {e}").into(),
                )
            })
    }

    /// Set the sender inbound messages are forwarded to
    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut forwarder = self.context.message_forwarder.lock().await;
        forwarder.set_message_sender(sender);
    }

    /// Publish at QoS 1, buffering the latest payload per topic while offline
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        {
            let mut undelivered = lock(&self.context.undelivered);
            let state = self.state_rx.borrow().clone();
            if let BusConnectionState::PermanentlyDisconnected(_) = state {
                return Err(MqttError::NotConnected { state });
            }
            if !self.started.load(Ordering::SeqCst) || !HealthMonitor::can_publish(&state) {
                if undelivered
                    .insert(topic.to_string(), (Bytes::from(payload), retain))
                    .is_some()
                {
                    debug!(topic, "Replaced buffered state");
                } else {
                    debug!(topic, "Buffered state until reconnect");
                }
                metrics().mqtt_message_buffered();
                return Ok(());
            }
        }

        self.context
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    /// Stop the event loop, sending DISCONNECT first when connected
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let handle = lock(&self.event_loop_handle).take();
        let Some(mut handle) = handle else {
            let _ = self.shutdown_tx.send(true);
            return Ok(());
        };

        if self.is_connected() && self.context.client.try_disconnect().is_ok() {
            if tokio::time::timeout(GRACEFUL_SHUTDOWN, &mut handle)
                .await
                .is_ok()
            {
                let _ = self.context.state_tx.send(BusConnectionState::Disconnected(
                    "Client disconnected".to_string(),
                ));
                info!("MQTT client disconnected");
                return Ok(());
            }
            warn!("Event loop did not flush DISCONNECT in time");
        }

        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(GRACEFUL_SHUTDOWN, &mut handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }
        let _ = self.context.state_tx.send(BusConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        info!("MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    /// Returns None if connect() hasn't been called yet
    pub fn connection_state(&self) -> Option<BusConnectionState> {
        self.started
            .load(Ordering::SeqCst)
            .then(|| self.state_rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(BusConnectionState::Connected))
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(BusConnectionState::PermanentlyDisconnected(_))
        )
    }

    /// Number of topics with state waiting for the next ConnAck
    pub fn undelivered_count(&self) -> usize {
        lock(&self.context.undelivered).len()
    }
}

impl EventLoopContext {
    /// Reconnection supervisor: polls the event loop until shutdown
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Starting MQTT event loop");
        let mut backoff = self.reconnect_config.policy.start();
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                            debug!("DISCONNECT sent");
                            false
                        }
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(
                                route,
                                &mut reconnect_attempts,
                                &mut backoff,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                        Err(e) => {
                            self.handle_event_loop_error(
                                e,
                                &mut reconnect_attempts,
                                &mut backoff,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!("MQTT event loop stopped");
    }

    fn set_state(&self, next: BusConnectionState) {
        let previous = self.state_tx.borrow().clone();
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
        let _ = self.state_tx.send(next);
    }

    /// Returns true to continue loop, false to break
    async fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        backoff: &mut Backoff,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *reconnect_attempts = 0;
                backoff.reset();
                metrics().mqtt_connection_established();
                self.resubscribe_to_topics();
                self.flush_undelivered();
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(topic, payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                metrics().mqtt_connection_lost();
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                self.reconnect_after_backoff(reconnect_attempts, backoff, shutdown_rx)
                    .await
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(packet_id, filters, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to continue loop (after backoff), false to break
    async fn handle_event_loop_error(
        &self,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
        backoff: &mut Backoff,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        if matches!(*self.state_tx.borrow(), BusConnectionState::Connected) {
            metrics().mqtt_connection_lost();
        } else {
            metrics().mqtt_connection_failed();
        }
        error!(error = %error, "MQTT event loop error");
        self.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::NetworkError(error.to_string()),
        ));
        self.reconnect_after_backoff(reconnect_attempts, backoff, shutdown_rx)
            .await
    }

    /// Sleep out the backoff; the next poll reconnects
    async fn reconnect_after_backoff(
        &self,
        reconnect_attempts: &mut u32,
        backoff: &mut Backoff,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            self.reconnect_config.max_attempts,
            *shutdown_rx.borrow(),
            backoff,
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                *reconnect_attempts = attempt;
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                metrics().mqtt_connection_attempt();

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    attempt,
                    max_attempts = %max_display,
                    delay_ms = delay.as_millis() as u64,
                    "Attempting MQTT reconnection"
                );

                interruptible_sleep(shutdown_rx, delay).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    *reconnect_attempts
                );
                self.set_state(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    async fn handle_message_received(&self, topic: String, payload: Bytes, retain: bool) {
        debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
        metrics().mqtt_message_received();

        let filters = lock(&self.subscribed_topics).clone();
        if !MessageHandler::should_process_message(&topic, retain, &filters) {
            return;
        }

        let message = InboundMessage {
            topic,
            payload,
            retain,
        };
        let forwarder = self.message_forwarder.lock().await;
        if let Err(e) = forwarder.forward_message(message).await {
            error!("Failed to forward message: {}", e);
        }
    }

    /// Re-issue every recorded subscription; clean start drops them on reconnect
    fn resubscribe_to_topics(&self) {
        let topics = lock(&self.subscribed_topics).clone();
        for topic in topics {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic),
                Err(e) => error!("Failed to re-subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Mark connected and send buffered state under the buffer lock so no
    /// concurrent publish can slip in between
    fn flush_undelivered(&self) {
        let mut undelivered = lock(&self.undelivered);
        self.set_state(HealthMonitor::determine_next_state(
            ConnectionEvent::ConnAckReceived,
        ));
        for (topic, (payload, retain)) in undelivered.drain() {
            match self
                .client
                .try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
            {
                Ok(()) => debug!(topic = %topic, "Flushed buffered state"),
                Err(e) => warn!(topic = %topic, error = %e, "Dropping buffered state"),
            }
        }
    }
}

/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[async_trait]
impl BusPublisher for MqttClient {
    type Error = MqttError;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topic_filter: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic_filter).await
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        MqttClient::set_message_sender(self, sender).await
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    fn connection_state(&self) -> Option<BusConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = lock(&self.event_loop_handle).take() {
            handle.abort();
        }
    }
}
