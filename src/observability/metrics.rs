//! Thread-safe metrics collection
//!
//! Atomic counters for command handling, device sessions, state publishing
//! and the MQTT link, plus a bounded window of operation latencies. The
//! snapshot is logged at shutdown.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Command handling
    commands_received: AtomicU64,
    commands_ignored: AtomicU64,
    commands_superseded: AtomicU64,
    commands_rejected: AtomicU64,
    commands_discarded: AtomicU64,
    unroutable_messages: AtomicU64,

    // Device operations
    operations_dispatched: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operation_times: Mutex<Vec<u64>>, // in milliseconds

    // Device sessions
    connect_attempts: AtomicU64,
    sessions_ready: AtomicU64,
    sessions_lost: AtomicU64,
    session_failures: AtomicU64,
    retries_scheduled: AtomicU64,

    // State publishing
    notifications_received: AtomicU64,
    notifications_dropped: AtomicU64,
    states_published: AtomicU64,
    state_publish_failures: AtomicU64,

    // MQTT link
    mqtt_connected: AtomicBool,
    mqtt_connection_attempts: AtomicU64,
    mqtt_connections_established: AtomicU64,
    mqtt_connection_failures: AtomicU64,
    mqtt_messages_received: AtomicU64,
    mqtt_messages_buffered: AtomicU64,

    // Lifecycle
    bridge_states: Mutex<HashMap<String, String>>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            commands_received: AtomicU64::new(0),
            commands_ignored: AtomicU64::new(0),
            commands_superseded: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            commands_discarded: AtomicU64::new(0),
            unroutable_messages: AtomicU64::new(0),
            operations_dispatched: AtomicU64::new(0),
            operations_succeeded: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operation_times: Mutex::new(Vec::new()),
            connect_attempts: AtomicU64::new(0),
            sessions_ready: AtomicU64::new(0),
            sessions_lost: AtomicU64::new(0),
            session_failures: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            notifications_received: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            states_published: AtomicU64::new(0),
            state_publish_failures: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            mqtt_connection_attempts: AtomicU64::new(0),
            mqtt_connections_established: AtomicU64::new(0),
            mqtt_connection_failures: AtomicU64::new(0),
            mqtt_messages_received: AtomicU64::new(0),
            mqtt_messages_buffered: AtomicU64::new(0),
            bridge_states: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Command metrics
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_ignored(&self) {
        self.commands_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_superseded(&self) {
        self.commands_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_discarded(&self) {
        self.commands_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_unroutable(&self) {
        self.unroutable_messages.fetch_add(1, Ordering::Relaxed);
    }

    // Operation metrics
    pub fn operation_dispatched(&self) {
        self.operations_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_completed(&self, duration: Duration, success: bool) {
        if success {
            self.operations_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.operations_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.record_operation_time(duration);
    }

    fn record_operation_time(&self, duration: Duration) {
        if let Ok(mut times) = self.operation_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > LATENCY_WINDOW {
                times.remove(0);
            }
        }
    }

    // Session metrics
    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ready(&self) {
        self.sessions_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    // State metrics
    pub fn notification_received(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_published(&self) {
        self.states_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_publish_failed(&self) {
        self.state_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.mqtt_connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.mqtt_connections_established
            .fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.mqtt_connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.mqtt_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_buffered(&self) {
        self.mqtt_messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_bridge_state(&self, device: &str, state: &str) {
        if let Ok(mut states) = self.bridge_states.lock() {
            let previous = states.insert(device.to_string(), state.to_string());
            if previous.as_deref() != Some(state) {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.commands_received,
            &self.commands_ignored,
            &self.commands_superseded,
            &self.commands_rejected,
            &self.commands_discarded,
            &self.unroutable_messages,
            &self.operations_dispatched,
            &self.operations_succeeded,
            &self.operations_failed,
            &self.connect_attempts,
            &self.sessions_ready,
            &self.sessions_lost,
            &self.session_failures,
            &self.retries_scheduled,
            &self.notifications_received,
            &self.notifications_dropped,
            &self.states_published,
            &self.state_publish_failures,
            &self.mqtt_connection_attempts,
            &self.mqtt_connections_established,
            &self.mqtt_connection_failures,
            &self.mqtt_messages_received,
            &self.mqtt_messages_buffered,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.operation_times.lock() {
            times.clear();
        }
        if let Ok(mut states) = self.bridge_states.lock() {
            states.clear();
        }
    }

    /// Latency statistics over the recorded window (pure function)
    fn operation_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.operation_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_operation_time_ms, operation_time_p50_ms, operation_time_p95_ms) =
            self.operation_time_statistics();
        let bridge_states = self
            .bridge_states
            .lock()
            .map(|states| states.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                ignored: self.commands_ignored.load(Ordering::Relaxed),
                superseded: self.commands_superseded.load(Ordering::Relaxed),
                rejected: self.commands_rejected.load(Ordering::Relaxed),
                discarded: self.commands_discarded.load(Ordering::Relaxed),
                unroutable: self.unroutable_messages.load(Ordering::Relaxed),
            },
            operations: OperationMetrics {
                dispatched: self.operations_dispatched.load(Ordering::Relaxed),
                succeeded: self.operations_succeeded.load(Ordering::Relaxed),
                failed: self.operations_failed.load(Ordering::Relaxed),
                avg_operation_time_ms,
                operation_time_p50_ms,
                operation_time_p95_ms,
            },
            sessions: SessionMetrics {
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                ready: self.sessions_ready.load(Ordering::Relaxed),
                lost: self.sessions_lost.load(Ordering::Relaxed),
                failures: self.session_failures.load(Ordering::Relaxed),
                retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            },
            state: StateMetrics {
                notifications_received: self.notifications_received.load(Ordering::Relaxed),
                notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
                published: self.states_published.load(Ordering::Relaxed),
                publish_failures: self.state_publish_failures.load(Ordering::Relaxed),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.mqtt_connection_attempts.load(Ordering::Relaxed),
                connections_established: self
                    .mqtt_connections_established
                    .load(Ordering::Relaxed),
                connection_failures: self.mqtt_connection_failures.load(Ordering::Relaxed),
                messages_received: self.mqtt_messages_received.load(Ordering::Relaxed),
                messages_buffered: self.mqtt_messages_buffered.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                bridge_states,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub commands: CommandMetrics,
    pub operations: OperationMetrics,
    pub sessions: SessionMetrics,
    pub state: StateMetrics,
    pub mqtt: MqttMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub ignored: u64,
    pub superseded: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub unroutable: u64,
}

#[derive(Debug, Serialize)]
pub struct OperationMetrics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_operation_time_ms: f64,
    pub operation_time_p50_ms: f64,
    pub operation_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub connect_attempts: u64,
    pub ready: u64,
    pub lost: u64,
    pub failures: u64,
    pub retries_scheduled: u64,
}

#[derive(Debug, Serialize)]
pub struct StateMetrics {
    pub notifications_received: u64,
    pub notifications_dropped: u64,
    pub published: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_received: u64,
    pub messages_buffered: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub bridge_states: HashMap<String, String>,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_command_metrics() {
        let collector = MetricsCollector::new();

        collector.command_received();
        collector.command_received();
        collector.command_superseded();
        collector.command_ignored();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.commands.received, 2);
        assert_eq!(metrics.commands.superseded, 1);
        assert_eq!(metrics.commands.ignored, 1);
        assert_eq!(metrics.commands.discarded, 0);
    }

    #[test]
    fn test_operation_latency() {
        let collector = MetricsCollector::new();

        collector.operation_dispatched();
        collector.operation_completed(Duration::from_millis(1500), true);
        collector.operation_dispatched();
        collector.operation_completed(Duration::from_millis(500), false);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.operations.dispatched, 2);
        assert_eq!(metrics.operations.succeeded, 1);
        assert_eq!(metrics.operations.failed, 1);
        assert!((metrics.operations.avg_operation_time_ms - 1000.0).abs() < 0.1);
    }

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_buffered();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.messages_buffered, 1);
        assert!(metrics.mqtt.connected);

        collector.mqtt_connection_lost();
        assert!(!collector.get_metrics().mqtt.connected);
    }

    #[test]
    fn test_bridge_state_transitions() {
        let collector = MetricsCollector::new();

        collector.set_bridge_state("front", "Connecting");
        collector.set_bridge_state("front", "Connecting");
        collector.set_bridge_state("front", "Ready");
        collector.set_bridge_state("back", "Connecting");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.lifecycle.state_transitions, 3);
        assert_eq!(
            metrics.lifecycle.bridge_states.get("front").map(String::as_str),
            Some("Ready")
        );
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    collector_clone.command_received();
                    collector_clone.state_published();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.commands.received, 1000);
        assert_eq!(metrics.state.published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);
        let p0 = percentile(&data, 0.0);
        let p100 = percentile(&data, 100.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert!((p0 - 1.0).abs() < 0.1, "P0: expected ~1.0, got {p0}");
        assert!(
            (p100 - 10.0).abs() < 0.1,
            "P100: expected ~10.0, got {p100}"
        );

        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();

        for i in 0..1500 {
            collector.operation_completed(Duration::from_millis(i), true);
        }

        let len = collector.operation_times.lock().unwrap().len();
        assert_eq!(len, LATENCY_WINDOW);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.command_received();
        collector.mqtt_connection_established();
        collector.set_bridge_state("front", "Ready");

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.commands.received, 0);
        assert!(!metrics.mqtt.connected);
        assert!(metrics.lifecycle.bridge_states.is_empty());
    }
}
