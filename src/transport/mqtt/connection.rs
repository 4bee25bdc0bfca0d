//! Pure connection state management for the MQTT channel
//!
//! This module contains pure functions for connection state management,
//! configuration handling, and topic construction.

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for the MQTT channel
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded or closed
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Build client options from config. Each call gets a fresh client id so
/// reconnects never collide with a lingering broker session.
pub fn configure_mqtt_options(
    channel_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let client_id = format!("draftflow-{channel_id}-{}", chrono::Utc::now().timestamp_millis());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(30));
    // Drafts and manuscripts exceed the common 10KB broker default
    mqtt_options.set_max_packet_size(Some(1024 * 1024));

    Ok(mqtt_options)
}

/// Normalize a topic: single leading slash, no empty levels, no trailing slash
pub fn canonicalize_topic(topic: &str) -> String {
    let levels: Vec<&str> = topic.split('/').filter(|l| !l.is_empty()).collect();
    format!("/{}", levels.join("/"))
}

pub struct TopicBuilder;

impl TopicBuilder {
    /// `{prefix}/processes/{process_id}/events`
    pub fn build_events_topic(prefix: &str, process_id: &str) -> String {
        canonicalize_topic(&format!("{prefix}/processes/{process_id}/events"))
    }

    /// `{prefix}/processes/{process_id}/responses`
    pub fn build_responses_topic(prefix: &str, process_id: &str) -> String {
        canonicalize_topic(&format!("{prefix}/processes/{process_id}/responses"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            topic_prefix: "draftflow".to_string(),
        }
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_topic_construction() {
        assert_eq!(
            TopicBuilder::build_events_topic("draftflow", "p-1"),
            "/draftflow/processes/p-1/events"
        );
        assert_eq!(
            TopicBuilder::build_responses_topic("//team//", "p-1"),
            "/team/processes/p-1/responses"
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        assert!(configure_mqtt_options("c-1", &test_mqtt_config()).is_ok());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();
        let result = configure_mqtt_options("c-1", &config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            prop_assert_eq!(canonicalize_topic(&first), first.clone());
            prop_assert!(first.starts_with('/'));
            prop_assert!(!first.contains("//"));
        }
    }
}
