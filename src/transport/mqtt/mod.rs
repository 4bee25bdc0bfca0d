//! MQTT notification channel
//!
//! Split the same way as the rest of the transport layer: pure functions
//! for configuration, topic construction, reconnection decisions and
//! message routing, plus the [`MqttChannel`] that performs the I/O.
//!
//! - [`connection`] - Connection state, options and topics
//! - [`message_handler`] - Event routing and reply parsing
//! - [`health_monitor`] - Reconnection decisions and liveness
//! - [`channel`] - The channel itself

pub mod channel;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use channel::MqttChannel;
pub use connection::{ConnectionState, MqttError, ReconnectConfig, TopicBuilder};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
