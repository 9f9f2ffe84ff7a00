//! Pure message routing and processing logic for MQTT events
//!
//! Classifies event-loop events and decides which inbound publishes reach
//! the bridge supervisor.

use crate::protocol::InboundMessage;
use bytes::Bytes;
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Determine if an inbound publish should be forwarded
    ///
    /// Retained messages are ignored so a stale command left on the broker is
    /// never replayed into a lock.
    pub fn should_process_message(topic: &str, retain: bool, filters: &[String]) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }

        if !filters.iter().any(|filter| topic_matches(filter, topic)) {
            debug!(topic, "Topic matches no subscription");
            return false;
        }

        true
    }

    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.clone(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        filters: suback.return_codes.len(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed for the given number of filters
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Message forwarding operations (impure I/O)
pub struct MessageForwarder {
    message_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            message_sender: None,
        }
    }

    pub fn set_message_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.message_sender = Some(sender);
    }

    /// Forward an inbound message to the supervisor
    pub async fn forward_message(&self, message: InboundMessage) -> Result<(), String> {
        if let Some(ref sender) = self.message_sender {
            sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward message to supervisor: {e}"))
        } else {
            warn!(topic = %message.topic, "Received MQTT message but no receiver configured - message dropped");
            Err("No message sender configured".to_string())
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("sesame/+/set", "sesame/abc/set"));
        assert!(!topic_matches("sesame/+/set", "sesame/abc/get"));
        assert!(!topic_matches("sesame/+/set", "sesame/a/b/set"));
        assert!(!topic_matches("sesame/+/set", "sesame/abc/set/extra"));
        assert!(topic_matches("home/door/set", "home/door/set"));
        assert!(topic_matches("sesame/#", "sesame/abc/set"));
        assert!(!topic_matches("home/door/set", "home/door"));
    }

    #[test]
    fn test_should_process_message() {
        let filters = vec!["sesame/+/set".to_string()];

        assert!(MessageHandler::should_process_message(
            "sesame/front/set",
            false,
            &filters
        ));

        // Retained commands are never replayed
        assert!(!MessageHandler::should_process_message(
            "sesame/front/set",
            true,
            &filters
        ));

        assert!(!MessageHandler::should_process_message(
            "/wrong/topic",
            false,
            &filters
        ));
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("sesame/front/set"),
            pkid: 1,
            payload: Bytes::from("LOCK"),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "sesame/front/set");
            assert_eq!(payload, Bytes::from("LOCK"));
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        let message = InboundMessage::new("sesame/front/set", "LOCK");

        assert!(forwarder.forward_message(message.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_message_sender(tx);

        assert!(forwarder.forward_message(message.clone()).await.is_ok());
        assert_eq!(rx.recv().await, Some(message));
    }
}
