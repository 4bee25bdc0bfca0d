//! Disconnection resilience
//!
//! Keepalive monitoring, background continuation of runs whose channel
//! dropped, and the supervisor that ties them to sessions.

pub mod background;
pub mod keepalive;
pub mod supervisor;

pub use background::{BackgroundStatus, BackgroundTask, BackgroundTasks};
pub use keepalive::{KeepaliveTracker, KeepaliveVerdict, MonitorExit};
pub use supervisor::{
    AttachOutcome, ConnectionResilienceSupervisor, DisconnectOutcome, ResilienceSettings,
};
