//! Bridge supervisor
//!
//! Owns one [`DeviceBridge`] per configured lock, keyed by routing identity,
//! and fans inbound bus messages out to them. The fan-out goes through each
//! bridge's own command queue, so routing never blocks on a slow device.

use super::backoff::BackoffPolicy;
use super::device_bridge::{BridgeHandle, BridgeSettings, DeviceBridge, StateOutlet};
use super::machine::BridgeCore;
use super::state::ConnectionState;
use super::translator::StateTranslator;
use crate::config::BridgeConfig;
use crate::device::{DeviceIdentity, DeviceSession, SessionFactory};
use crate::error::{sanitize_error_message, BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use crate::protocol::{normalize_device_id, CommandVocabulary, InboundMessage, TopicLayout};
use crate::transport::BusPublisher;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one inbound bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued on the addressed bridge
    Delivered { device: String },
    /// Retained commands are never replayed
    RetainedIgnored,
    /// Topic does not address any device
    UnknownTopic,
    /// Topic addresses an identity with no bridge
    UnknownDevice { device: String },
    /// The bridge exists but no longer accepts commands
    BridgeClosed { device: String },
}

type Routes = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

/// Cheap, cloneable topic-to-bridge router
#[derive(Clone)]
pub struct CommandRouter {
    layout: Arc<TopicLayout>,
    routes: Routes,
}

impl CommandRouter {
    fn new(layout: TopicLayout) -> Self {
        Self {
            layout: Arc::new(layout),
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn insert(&self, device: String, commands: mpsc::UnboundedSender<Bytes>) {
        let mut routes = match self.routes.write() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        routes.insert(device, commands);
    }

    /// Route one inbound message to its bridge
    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        if message.retain {
            debug!(topic = %message.topic, "Ignoring retained command");
            return RouteOutcome::RetainedIgnored;
        }

        let Some(device) = self.layout.device_for_topic(&message.topic) else {
            debug!(topic = %message.topic, "No device addressed by topic");
            metrics().message_unroutable();
            return RouteOutcome::UnknownTopic;
        };
        let device = normalize_device_id(device);

        let routes = match self.routes.read() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(commands) = routes.get(&device) else {
            warn!(device = %device, topic = %message.topic, "Command for unknown device");
            metrics().message_unroutable();
            return RouteOutcome::UnknownDevice { device };
        };

        match commands.send(message.payload.clone()) {
            Ok(()) => RouteOutcome::Delivered { device },
            Err(_) => {
                debug!(device = %device, "Bridge closed, command dropped");
                metrics().command_discarded();
                RouteOutcome::BridgeClosed { device }
            }
        }
    }

    /// Pump messages from the bus client until cancelled or the bus closes
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.route(&message);
                    }
                    None => {
                        debug!("Inbound message channel closed");
                        break;
                    }
                },
            }
        }
    }
}

/// Supervisor-wide settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub bridge: BridgeSettings,
    pub backoff: BackoffPolicy,
    /// Upper bound for all bridges to reach `Disconnected`
    pub shutdown_timeout: Duration,
    /// Publish state with the retain flag
    pub retain_state: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings::default(),
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(20),
            retain_state: false,
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            bridge: BridgeSettings::from_config(config),
            backoff: BackoffPolicy::from_section(&config.reconnect),
            shutdown_timeout: Duration::from_secs(config.bridge.shutdown_timeout_secs),
            retain_state: config.mqtt.retain_state,
        }
    }
}

/// Outcome of [`BridgeSupervisor::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Bridges that reached `Disconnected` in time
    pub closed: Vec<String>,
    /// Bridges still running at the deadline
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Owns every device bridge
pub struct BridgeSupervisor<P: BusPublisher> {
    vocabulary: CommandVocabulary,
    translator: StateTranslator,
    settings: SupervisorSettings,
    publisher: Arc<P>,
    bridges: HashMap<String, BridgeHandle>,
    router: CommandRouter,
    cancel: CancellationToken,
}

impl<P: BusPublisher> BridgeSupervisor<P> {
    pub fn new(
        layout: TopicLayout,
        vocabulary: CommandVocabulary,
        translator: StateTranslator,
        settings: SupervisorSettings,
        publisher: Arc<P>,
    ) -> Self {
        Self {
            vocabulary,
            translator,
            settings,
            publisher,
            bridges: HashMap::new(),
            router: CommandRouter::new(layout),
            cancel: CancellationToken::new(),
        }
    }

    /// Supervisor for a validated configuration; no bridges are started yet
    pub fn from_config(config: &BridgeConfig, publisher: Arc<P>) -> Self {
        Self::new(
            TopicLayout::from_config(config),
            CommandVocabulary::from_section(&config.command_section()),
            StateTranslator::from_config(config),
            SupervisorSettings::from_config(config),
            publisher,
        )
    }

    /// Start the bridge for one lock
    pub fn start_bridge(
        &mut self,
        identity: DeviceIdentity,
        session: Arc<dyn DeviceSession>,
    ) -> BridgeResult<()> {
        let id = identity.id().to_string();
        if self.bridges.contains_key(&id) {
            return Err(BridgeError::DuplicateDevice(id));
        }

        let core = BridgeCore::new(
            id.clone(),
            self.vocabulary.clone(),
            self.translator.clone(),
            self.settings.backoff.start(),
        );
        let outlet = StateOutlet::new(
            self.router.layout.state_topic(&id),
            Arc::clone(&self.publisher),
            self.settings.retain_state,
        );
        let handle = DeviceBridge::spawn(
            identity,
            core,
            session,
            outlet,
            self.settings.bridge,
            self.cancel.child_token(),
        );

        self.router.insert(id.clone(), handle.commands());
        info!(device = %id, "Bridge registered");
        self.bridges.insert(id, handle);
        Ok(())
    }

    /// Start a bridge for every identity. A session that cannot be created
    /// is logged and skipped so other locks still come up. Returns the
    /// number of bridges started.
    pub fn start_all(
        &mut self,
        identities: Vec<DeviceIdentity>,
        factory: &dyn SessionFactory,
    ) -> BridgeResult<usize> {
        let mut started = 0;
        for identity in identities {
            match factory.create(&identity) {
                Ok(session) => {
                    self.start_bridge(identity, session)?;
                    started += 1;
                }
                Err(e) => {
                    error!(
                        device = %identity.id(),
                        error = %sanitize_error_message(&e.to_string()),
                        "Failed to create device session"
                    );
                }
            }
        }
        info!(started, "Bridges started");
        Ok(started)
    }

    /// Route one inbound message to its bridge
    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        self.router.route(message)
    }

    /// Router usable from another task
    pub fn router(&self) -> CommandRouter {
        self.router.clone()
    }

    pub fn connection_state(&self, device: &str) -> Option<ConnectionState> {
        self.bridges.get(device).map(BridgeHandle::state)
    }

    /// Connection state of every bridge, ordered by identity
    pub fn connection_states(&self) -> BTreeMap<String, ConnectionState> {
        self.bridges
            .iter()
            .map(|(id, handle)| (id.clone(), handle.state()))
            .collect()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bridges.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every bridge and wait for them up to the shutdown timeout;
    /// stragglers are aborted
    pub async fn shutdown(&mut self) -> ShutdownReport {
        info!(bridges = self.bridges.len(), "Shutting down bridges");
        self.cancel.cancel();

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut report = ShutdownReport::default();
        let mut bridges: Vec<(String, BridgeHandle)> = self.bridges.drain().collect();
        bridges.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, mut handle) in bridges {
            if handle.join_until(deadline).await {
                report.closed.push(id);
            } else {
                warn!(device = %id, state = %handle.state(), "Bridge aborted at shutdown deadline");
                report.aborted.push(id);
            }
        }

        info!(
            closed = report.closed.len(),
            aborted = report.aborted.len(),
            "Bridge shutdown complete"
        );
        report
    }
}

impl<P: BusPublisher> Drop for BridgeSupervisor<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
