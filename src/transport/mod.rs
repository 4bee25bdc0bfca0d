//! Operator notification channels
//!
//! A channel carries [`ProcessEvent`]s to the operator and
//! [`OperatorReply`]s back. Sends are best-effort and never fail the
//! pipeline: a closed or broken channel simply drops events. Keepalive
//! lets the resilience supervisor notice a dead connection.

pub mod console;
pub mod events;
pub mod memory;
pub mod mqtt;

pub use console::ConsoleChannel;
pub use events::ProcessEvent;
pub use memory::MemoryChannel;
pub use mqtt::MqttChannel;

use crate::gate::OperatorReply;

#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable identifier of this connection
    fn channel_id(&self) -> &str;

    /// Deliver an event. Never errors; failures are logged and dropped.
    async fn send(&self, process_id: &str, event: &ProcessEvent);

    /// Next operator reply for `process_id`, or `None` once the channel is
    /// closed. Waiting here never blocks `send`.
    async fn receive(&self, process_id: &str) -> Option<OperatorReply>;

    /// Probe the remote end; `false` counts as a missed keepalive
    async fn keepalive(&self) -> bool;

    /// Terminate the connection from this side
    async fn close(&self, reason: &str);

    fn is_open(&self) -> bool;
}
