//! Bridge process lifecycle
//!
//! Wires the bus transport to the supervisor: connect, subscribe, start one
//! bridge per lock, pump inbound commands, and tear everything down in
//! order on shutdown.

use crate::bridge::{BridgeSupervisor, ConnectionState, ShutdownReport};
use crate::config::BridgeConfig;
use crate::device::{DeviceIdentity, SessionFactory};
use crate::error::BridgeError;
use crate::protocol::{InboundMessage, TopicLayout};
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

const INBOUND_CHANNEL_CAPACITY: usize = 100;

/// Bridge lifecycle with an injected transport
pub struct BridgeLifecycle<T>
where
    T: Transport,
{
    config: BridgeConfig,
    transport: Arc<T>,
    supervisor: Option<BridgeSupervisor<T>>,
    router_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<T> BridgeLifecycle<T>
where
    T: Transport,
{
    pub fn new(config: BridgeConfig, transport: T) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            supervisor: None,
            router_handle: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn is_started(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Connect the bus, subscribe to command topics and start every bridge
    pub async fn start(&mut self, sessions: &dyn SessionFactory) -> Result<(), LifecycleError> {
        if self.is_started() {
            return Err(LifecycleError::AlreadyStarted);
        }
        let span = crate::lifecycle_span!(phase = "startup");

        async {
            let (inbound_tx, inbound_rx) =
                mpsc::channel::<InboundMessage>(INBOUND_CHANNEL_CAPACITY);
            self.transport.set_message_sender(inbound_tx).await;

            self.transport
                .connect()
                .await
                .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
            info!("Bus transport connected");

            for topic in TopicLayout::from_config(&self.config).subscriptions() {
                self.transport
                    .subscribe(&topic)
                    .await
                    .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
                info!(topic = %topic, "Subscribed to command topic");
            }

            let mut supervisor =
                BridgeSupervisor::from_config(&self.config, Arc::clone(&self.transport));
            let identities = DeviceIdentity::all_from_config(&self.config);
            let configured = identities.len();
            let started = supervisor.start_all(identities, sessions)?;
            if started < configured {
                warn!(started, configured, "Some bridges could not be started");
            }

            let router = supervisor.router();
            self.router_handle = Some(tokio::spawn(
                router
                    .run(inbound_rx, self.cancel.child_token())
                    .in_current_span(),
            ));
            self.supervisor = Some(supervisor);

            info!(bridges = started, "Bridge lifecycle started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Connection state of every bridge
    pub fn connection_states(&self) -> BTreeMap<String, ConnectionState> {
        self.supervisor
            .as_ref()
            .map(BridgeSupervisor::connection_states)
            .unwrap_or_default()
    }

    /// Close all bridges, stop routing, then release the bus connection
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, LifecycleError> {
        let mut supervisor = self.supervisor.take().ok_or(LifecycleError::NotStarted)?;
        let span = crate::lifecycle_span!(phase = "shutdown");

        async {
            let report = supervisor.shutdown().await;

            self.cancel.cancel();
            if let Some(handle) = self.router_handle.take() {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!("Command router shutdown error: {}", e);
                    }
                }
            }

            self.transport
                .disconnect()
                .await
                .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;

            info!(clean = report.is_clean(), "Bridge lifecycle stopped");
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Transport error: {0}")]
    TransportError(Box<dyn std::error::Error + Send + Sync>),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Lifecycle already started")]
    AlreadyStarted,

    #[error("Lifecycle not started")]
    NotStarted,
}
