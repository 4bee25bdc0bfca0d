//! Pure reconnection and state-transition logic for the MQTT channel

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to try reconnecting after `current_attempts` failures
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT channel connected");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!("MQTT broker disconnected channel");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!(error = %error, "MQTT event loop error");
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!(attempt, "Starting MQTT reconnection attempt");
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!(reason = %reason, "MQTT channel permanently disconnected");
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Only a connected channel answers keepalive
    pub fn is_alive(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn is_closed(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::PermanentlyDisconnected(_))
    }
}

#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..ReconnectConfig::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &limited, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_liveness_follows_state() {
        let connected = HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived);
        assert!(HealthMonitor::is_alive(&connected));

        let dropped =
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError("reset".into()));
        assert!(!HealthMonitor::is_alive(&dropped));
        assert!(!HealthMonitor::is_closed(&dropped));

        let failed =
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure("gone".into()));
        assert!(HealthMonitor::is_closed(&failed));
    }
}
