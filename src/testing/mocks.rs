//! Mock implementations for testing
//!
//! Provides a mock bus transport and scriptable device sessions so bridges
//! can be exercised without a broker or a lock in radio range.

use crate::device::{
    DeviceIdentity, DeviceSession, LockAction, MechStatus, RawNotification, SessionError,
    SessionEvent, SessionFactory,
};
use crate::protocol::InboundMessage;
use crate::transport::mqtt::{BusConnectionState, MqttError};
use crate::transport::{BusPublisher, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;

/// How long the `wait_for_*` helpers wait before giving up
const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn wait_for_count(counter: &watch::Sender<usize>, count: usize) {
    let mut rx = counter.subscribe();
    let _ = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|c| *c >= count)).await;
}

/// One message published through [`MockBus`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Mock bus transport for testing
#[derive(Debug)]
pub struct MockBus {
    published: StdMutex<Vec<PublishedMessage>>,
    published_count: watch::Sender<usize>,
    subscriptions: StdMutex<Vec<String>>,
    message_sender: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    fail_publishes: AtomicBool,
    fail_connect: AtomicBool,
    connected: AtomicBool,
    disconnect_calls: AtomicUsize,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            published: StdMutex::new(Vec::new()),
            published_count: watch::Sender::new(0),
            subscriptions: StdMutex::new(Vec::new()),
            message_sender: Mutex::new(None),
            fail_publishes: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_connect_failure() -> Self {
        let bus = Self::new();
        bus.fail_connect.store(true, Ordering::SeqCst);
        bus
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Messages published to one topic, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages were published, then return all
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<PublishedMessage> {
        wait_for_count(&self.published_count, count).await;
        self.published()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Deliver a message as if it arrived from the broker.
    /// Returns false when no receiver is installed.
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let sender = self.message_sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BusPublisher for MockBus {
    type Error = MqttError;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        let count = {
            let mut published = lock(&self.published);
            published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                retain,
            });
            published.len()
        };
        self.published_count.send_replace(count);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockBus {
    async fn connect(&self) -> Result<(), Self::Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Mock connection failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str) -> Result<(), Self::Error> {
        lock(&self.subscriptions).push(topic_filter.to_string());
        Ok(())
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.message_sender.lock().await = Some(sender);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<BusConnectionState> {
        Some(if self.is_connected() {
            BusConnectionState::Connected
        } else {
            BusConnectionState::Disconnected("Mock disconnection".to_string())
        })
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }
}

/// Scriptable device session
#[derive(Debug)]
pub struct MockSession {
    events: broadcast::Sender<SessionEvent>,
    operations: StdMutex<Vec<(LockAction, String)>>,
    operation_count: watch::Sender<usize>,
    hold_operations: watch::Sender<bool>,
    remaining_connect_failures: AtomicUsize,
    fail_authentications: AtomicBool,
    fail_operations: AtomicBool,
    hang_connects: AtomicBool,
    hang_disconnects: AtomicBool,
    connect_calls: AtomicUsize,
    connect_times: StdMutex<Vec<Instant>>,
    authenticate_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Session that connects, authenticates and acknowledges immediately
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            operations: StdMutex::new(Vec::new()),
            operation_count: watch::Sender::new(0),
            hold_operations: watch::Sender::new(false),
            remaining_connect_failures: AtomicUsize::new(0),
            fail_authentications: AtomicBool::new(false),
            fail_operations: AtomicBool::new(false),
            hang_connects: AtomicBool::new(false),
            hang_disconnects: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            connect_times: StdMutex::new(Vec::new()),
            authenticate_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` connect calls
    pub fn fail_next_connects(&self, count: usize) {
        self.remaining_connect_failures
            .store(count, Ordering::SeqCst);
    }

    pub fn fail_authentications(&self, fail: bool) {
        self.fail_authentications.store(fail, Ordering::SeqCst);
    }

    pub fn fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::SeqCst);
    }

    /// Connect calls made while set never complete
    pub fn hang_connects(&self, hang: bool) {
        self.hang_connects.store(hang, Ordering::SeqCst);
    }

    /// Disconnect calls made while set never complete
    pub fn hang_disconnects(&self, hang: bool) {
        self.hang_disconnects.store(hang, Ordering::SeqCst);
    }

    /// Operations are recorded but not acknowledged until released
    pub fn hold_operations(&self) {
        self.hold_operations.send_replace(true);
    }

    pub fn release_operations(&self) {
        self.hold_operations.send_replace(false);
    }

    /// Push a session event to the bridge
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Report a settled locked or unlocked status
    pub fn emit_status(&self, locked: bool) {
        self.emit(SessionEvent::Notification(RawNotification::MechStatus(
            MechStatus {
                position: if locked { 0 } else { 256 },
                battery_voltage: 6.01,
                battery_percentage: 88,
                in_lock_range: locked,
                in_unlock_range: !locked,
                is_stopped: true,
                is_battery_critical: false,
            },
        )));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.emit(SessionEvent::ConnectionLost(reason.to_string()));
    }

    pub fn operations(&self) -> Vec<LockAction> {
        lock(&self.operations).iter().map(|(a, _)| *a).collect()
    }

    pub fn history_names(&self) -> Vec<String> {
        lock(&self.operations)
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Wait until at least `count` operations were sent, then return all
    pub async fn wait_for_operations(&self, count: usize) -> Vec<LockAction> {
        wait_for_count(&self.operation_count, count).await;
        self.operations()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// When each connect call started, on the tokio clock
    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.connect_times).clone()
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSession for MockSession {
    async fn connect(&self) -> Result<(), SessionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.connect_times).push(Instant::now());
        if self.hang_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failed = self
            .remaining_connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SessionError::ConnectFailed("Mock out of range".to_string()));
        }
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), SessionError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_authentications.load(Ordering::SeqCst) {
            return Err(SessionError::AuthenticationFailed(
                "Mock login rejected".to_string(),
            ));
        }
        Ok(())
    }

    async fn send_operation(
        &self,
        action: LockAction,
        history_name: &str,
    ) -> Result<(), SessionError> {
        let count = {
            let mut operations = lock(&self.operations);
            operations.push((action, history_name.to_string()));
            operations.len()
        };
        self.operation_count.send_replace(count);

        let mut hold = self.hold_operations.subscribe();
        let _ = hold.wait_for(|held| !*held).await;

        if self.fail_operations.load(Ordering::SeqCst) {
            return Err(SessionError::OperationFailed("Mock nack".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_disconnects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Factory handing out one [`MockSession`] per identity
#[derive(Debug, Default)]
pub struct MockSessionFactory {
    sessions: StdMutex<HashMap<String, Arc<MockSession>>>,
    failing: StdMutex<HashSet<String>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for an identity, created on first use
    pub fn session_for(&self, id: &str) -> Arc<MockSession> {
        Arc::clone(
            lock(&self.sessions)
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(MockSession::new())),
        )
    }

    /// Make `create` fail for an identity
    pub fn fail_for(&self, id: &str) {
        lock(&self.failing).insert(id.to_string());
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, identity: &DeviceIdentity) -> Result<Arc<dyn DeviceSession>, SessionError> {
        if lock(&self.failing).contains(identity.id()) {
            return Err(SessionError::ConnectFailed(format!(
                "No adapter for {}",
                identity.address()
            )));
        }
        let session: Arc<dyn DeviceSession> = self.session_for(identity.id());
        Ok(session)
    }
}
