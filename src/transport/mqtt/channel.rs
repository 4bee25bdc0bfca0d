//! MQTT-backed notification channel
//!
//! Events are published to `{prefix}/processes/{id}/events`; operator
//! replies arrive on `{prefix}/processes/{id}/responses`. The event loop runs
//! on its own task, reconnects with the configured backoff pattern and
//! feeds connection state into [`NotificationChannel::keepalive`].

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, TopicBuilder,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::gate::OperatorReply;
use crate::observability::metrics::metrics;
use crate::transport::{NotificationChannel, ProcessEvent};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MqttChannel {
    channel_id: String,
    process_id: String,
    events_topic: String,
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    replies: Mutex<mpsc::Receiver<OperatorReply>>,
    closed: AtomicBool,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct EventLoopContext {
    responses_topic: String,
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reply_tx: mpsc::Sender<OperatorReply>,
    reconnect: ReconnectConfig,
}

impl MqttChannel {
    /// Connect and subscribe to the reply topic for `process_id`. Returns
    /// once the broker has acknowledged the connection.
    pub async fn connect(config: &MqttSection, process_id: &str) -> Result<Self, MqttError> {
        Self::connect_with(config, process_id, ReconnectConfig::default()).await
    }

    pub async fn connect_with(
        config: &MqttSection,
        process_id: &str,
        reconnect: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let channel_id = format!("mqtt-{}", Uuid::new_v4());
        metrics().mqtt_connection_attempt();
        let options = configure_mqtt_options(&channel_id, config)?;
        let (client, event_loop) = AsyncClient::new(options, 64);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(32);

        let context = EventLoopContext {
            responses_topic: TopicBuilder::build_responses_topic(&config.topic_prefix, process_id),
            client: client.clone(),
            state_tx,
            shutdown_rx,
            reply_tx,
            reconnect,
        };
        let span = crate::channel_span!(channel_id = %channel_id, process_id = %process_id);
        let handle = tokio::spawn(run_event_loop(event_loop, context).instrument(span));

        let channel = Self {
            channel_id,
            process_id: process_id.to_string(),
            events_topic: TopicBuilder::build_events_topic(&config.topic_prefix, process_id),
            client,
            state_rx: state_rx.clone(),
            shutdown_tx,
            replies: Mutex::new(reply_rx),
            closed: AtomicBool::new(false),
            event_loop_handle: std::sync::Mutex::new(Some(handle)),
        };

        if let Err(e) = wait_for_connection_confirmation(state_rx, CONNACK_TIMEOUT).await {
            channel.close("connection failed").await;
            return Err(e);
        }
        info!(channel_id = %channel.channel_id, topic = %channel.events_topic, "MQTT channel ready");
        Ok(channel)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }
}

#[async_trait]
impl NotificationChannel for MqttChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn send(&self, process_id: &str, event: &ProcessEvent) {
        if process_id != self.process_id || !self.is_open() {
            debug!(process_id, event = event.name(), "MQTT channel not serving process, dropping event");
            return;
        }
        let payload = match MessageHandler::format_event(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping unserializable event");
                return;
            }
        };
        // try_publish never blocks the pipeline when the request queue is full
        if let Err(e) = self
            .client
            .try_publish(self.events_topic.clone(), QoS::AtLeastOnce, false, payload)
        {
            metrics().mqtt_publish_failed();
            warn!(event = event.name(), error = %e, "Failed to publish event");
        } else {
            metrics().mqtt_message_published();
        }
    }

    async fn receive(&self, process_id: &str) -> Option<OperatorReply> {
        if process_id != self.process_id {
            return None;
        }
        self.replies.lock().await.recv().await
    }

    async fn keepalive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && HealthMonitor::is_alive(&self.state_rx.borrow())
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel_id = %self.channel_id, reason, "Closing MQTT channel");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !HealthMonitor::is_closed(&self.state_rx.borrow())
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), MqttError> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(MqttError::ConnectionFailed(reason.clone()))
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailed("State channel closed".to_string()));
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(MqttError::ConnectionFailed(
            "ConnAck timeout - no connection confirmation received".to_string(),
        ))
    })
}

async fn run_event_loop(mut event_loop: EventLoop, mut ctx: EventLoopContext) {
    let mut reconnect_attempts = 0u32;

    loop {
        let polled = tokio::select! {
            _ = ctx.shutdown_rx.changed() => {
                if *ctx.shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    reconnect_attempts = 0;
                    metrics().mqtt_connection_established();
                    ctx.state_tx
                        .send_replace(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
                    // Clean sessions drop subscriptions, so subscribe on every ConnAck
                    if let Err(e) = ctx
                        .client
                        .subscribe(ctx.responses_topic.clone(), QoS::AtLeastOnce)
                        .await
                    {
                        warn!(topic = %ctx.responses_topic, error = %e, "Failed to subscribe");
                    }
                }
                EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                } => {
                    if !MessageHandler::should_process_message(&topic, retain, &ctx.responses_topic) {
                        continue;
                    }
                    match MessageHandler::parse_reply(&payload) {
                        Ok(reply) => {
                            metrics().mqtt_message_received();
                            if ctx.reply_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed operator reply"),
                    }
                }
                EventRoute::Disconnected => {
                    metrics().mqtt_connection_lost();
                    ctx.state_tx.send_replace(HealthMonitor::determine_next_state(
                        ConnectionEvent::DisconnectedByBroker,
                    ));
                }
                EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent => {}
            },
            Err(e) => {
                ctx.state_tx.send_replace(HealthMonitor::determine_next_state(
                    ConnectionEvent::NetworkError(e.to_string()),
                ));
                let shutdown = *ctx.shutdown_rx.borrow();
                match HealthMonitor::should_attempt_reconnection(
                    reconnect_attempts,
                    &ctx.reconnect,
                    shutdown,
                ) {
                    ReconnectionDecision::Proceed { attempt, delay_ms } => {
                        reconnect_attempts = attempt;
                        ctx.state_tx.send_replace(HealthMonitor::determine_next_state(
                            ConnectionEvent::ReconnectionStarted(attempt),
                        ));
                        let interrupted = tokio::select! {
                            _ = ctx.shutdown_rx.changed() => *ctx.shutdown_rx.borrow(),
                            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
                        };
                        if interrupted {
                            break;
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => break,
                    ReconnectionDecision::AbortMaxAttemptsExceeded => {
                        let reason = format!(
                            "Max reconnection attempts ({}) exceeded",
                            ctx.reconnect.max_attempts.unwrap_or(reconnect_attempts)
                        );
                        ctx.state_tx.send_replace(HealthMonitor::determine_next_state(
                            ConnectionEvent::PermanentFailure(reason),
                        ));
                        break;
                    }
                }
            }
        }
    }

    if !HealthMonitor::is_closed(&ctx.state_tx.borrow()) {
        ctx.state_tx
            .send_replace(ConnectionState::PermanentlyDisconnected("Event loop stopped".to_string()));
    }
    info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(ConnectionState::Connected);
        });
        assert!(wait_for_connection_confirmation(rx, Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_tx, rx) = watch::channel(ConnectionState::Connecting);
        let result = wait_for_connection_confirmation(rx, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_permanent_failure() {
        let (_tx, rx) = watch::channel(ConnectionState::PermanentlyDisconnected("no".into()));
        let result = wait_for_connection_confirmation(rx, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MqttError::ConnectionFailed(reason)) if reason == "no"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let config = MqttSection {
            broker_url: "not a url".to_string(),
            username_env: None,
            password_env: None,
            topic_prefix: "draftflow".to_string(),
        };
        let result = MqttChannel::connect(&config, "p-1").await;
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }
}
