//! Pure routing of MQTT events and operator reply parsing

use crate::gate::OperatorReply;
use crate::transport::ProcessEvent;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use tracing::debug;

pub struct MessageHandler;

impl MessageHandler {
    pub fn parse_reply(payload: &[u8]) -> Result<OperatorReply, String> {
        serde_json::from_slice::<OperatorReply>(payload)
            .map_err(|e| format!("Failed to parse operator reply: {e}"))
    }

    pub fn format_event(event: &ProcessEvent) -> Result<String, String> {
        serde_json::to_string(event).map_err(|e| format!("Serialization error: {e}"))
    }

    /// Retained replies are stale by definition and must not be replayed
    pub fn should_process_message(topic: &str, retain: bool, expected_topic: &str) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        if topic != expected_topic {
            debug!(expected = expected_topic, topic, "Topic mismatch");
            return false;
        }
        true
    }

    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                retain: publish.retain,
            },
            Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    /// PingResp, SubAck and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::OperatorResponse;
    use crate::steps::Step;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_parse_reply() {
        let reply = MessageHandler::parse_reply(br#"{"action":"approve"}"#).unwrap();
        assert_eq!(reply.response, OperatorResponse::Approve);
        assert!(MessageHandler::parse_reply(b"not json").is_err());
    }

    #[test]
    fn test_format_event() {
        let payload = MessageHandler::format_event(&ProcessEvent::StepStarted {
            step: Step::Research,
        })
        .unwrap();
        assert!(payload.contains("\"event\":\"step_started\""));
    }

    #[test]
    fn test_should_process_message() {
        let topic = "/draftflow/processes/p/responses";
        assert!(MessageHandler::should_process_message(topic, false, topic));
        assert!(!MessageHandler::should_process_message(topic, true, topic));
        assert!(!MessageHandler::should_process_message("/other", false, topic));
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("/draftflow/processes/p/responses"),
            pkid: 1,
            payload: Bytes::from(r#"{"action":"regenerate"}"#),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "/draftflow/processes/p/responses");
                assert!(MessageHandler::parse_reply(&payload).is_ok());
                assert!(!retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }
}
