//! Thread-safe metrics collection
//!
//! Atomic counters for high-frequency events and mutex-protected
//! collections for latency samples. One global collector serves the whole
//! process; [`MetricsCollector::get_metrics`] produces a serializable
//! snapshot for the health server.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Processes
    processes_started: AtomicU64,
    processes_active: AtomicU64,
    processes_completed: AtomicU64,
    processes_failed: AtomicU64,
    processes_cancelled: AtomicU64,
    steps_executed: AtomicU64,
    run_times: Mutex<Vec<u64>>,

    // Agents
    agent_retries: AtomicU64,
    agent_stats: Mutex<HashMap<String, AgentStats>>,
    fanout_tasks: AtomicU64,
    fanout_failures: AtomicU64,

    // Operator input
    inputs_requested: AtomicU64,
    inputs_rejected: AtomicU64,
    input_timeouts: AtomicU64,

    // Resilience
    disconnects: AtomicU64,
    detaches: AtomicU64,
    reattaches: AtomicU64,

    // Persistence
    snapshots_created: AtomicU64,
    persistence_failures: AtomicU64,

    // MQTT transport
    mqtt_connected: AtomicBool,
    mqtt_connection_attempts: AtomicU64,
    mqtt_messages_published: AtomicU64,
    mqtt_publish_failures: AtomicU64,
    mqtt_messages_received: AtomicU64,

    uptime_start: AtomicU64,
    health_status: AtomicBool,
}

#[derive(Debug, Default)]
struct AgentStats {
    invocations: u64,
    failures: u64,
    latencies: Vec<u64>,
    last_invocation: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            processes_started: AtomicU64::new(0),
            processes_active: AtomicU64::new(0),
            processes_completed: AtomicU64::new(0),
            processes_failed: AtomicU64::new(0),
            processes_cancelled: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            run_times: Mutex::new(Vec::new()),
            agent_retries: AtomicU64::new(0),
            agent_stats: Mutex::new(HashMap::new()),
            fanout_tasks: AtomicU64::new(0),
            fanout_failures: AtomicU64::new(0),
            inputs_requested: AtomicU64::new(0),
            inputs_rejected: AtomicU64::new(0),
            input_timeouts: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            detaches: AtomicU64::new(0),
            reattaches: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            mqtt_connection_attempts: AtomicU64::new(0),
            mqtt_messages_published: AtomicU64::new(0),
            mqtt_publish_failures: AtomicU64::new(0),
            mqtt_messages_received: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
            health_status: AtomicBool::new(true),
        }
    }

    // Process lifecycle
    pub fn process_started(&self) {
        self.processes_started.fetch_add(1, Ordering::Relaxed);
        self.processes_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A run ended without reaching a terminal step (suspended at a pause)
    pub fn process_suspended(&self, duration: Duration) {
        self.leave_active(duration);
    }

    pub fn process_completed(&self, duration: Duration) {
        self.processes_completed.fetch_add(1, Ordering::Relaxed);
        self.leave_active(duration);
    }

    pub fn process_failed(&self, duration: Duration) {
        self.processes_failed.fetch_add(1, Ordering::Relaxed);
        self.leave_active(duration);
    }

    pub fn process_cancelled(&self, duration: Duration) {
        self.processes_cancelled.fetch_add(1, Ordering::Relaxed);
        self.leave_active(duration);
    }

    fn leave_active(&self, duration: Duration) {
        let _ = self
            .processes_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Ok(mut times) = self.run_times.lock() {
            push_bounded(&mut times, duration.as_millis() as u64);
        }
    }

    pub fn step_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    // Agents
    pub fn agent_invocation(&self, agent_id: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.agent_stats.lock() {
            let entry = stats.entry(agent_id.to_string()).or_default();
            entry.invocations += 1;
            entry.last_invocation = current_timestamp();
            push_bounded(&mut entry.latencies, duration.as_millis() as u64);
            if !success {
                entry.failures += 1;
            }
        }
    }

    pub fn agent_retry(&self) {
        self.agent_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fanout(&self, tasks: usize, failures: usize) {
        self.fanout_tasks.fetch_add(tasks as u64, Ordering::Relaxed);
        self.fanout_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    // Operator input
    pub fn input_requested(&self) {
        self.inputs_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_rejected(&self) {
        self.inputs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_timeout(&self) {
        self.input_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // Resilience
    pub fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reattach(&self) {
        self.reattaches.fetch_add(1, Ordering::Relaxed);
    }

    // Persistence
    pub fn snapshot_created(&self) {
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    // MQTT
    pub fn mqtt_connection_attempt(&self) {
        self.mqtt_connection_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.mqtt_messages_published
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.mqtt_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.mqtt_messages_received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.processes_started,
            &self.processes_active,
            &self.processes_completed,
            &self.processes_failed,
            &self.processes_cancelled,
            &self.steps_executed,
            &self.agent_retries,
            &self.fanout_tasks,
            &self.fanout_failures,
            &self.inputs_requested,
            &self.inputs_rejected,
            &self.input_timeouts,
            &self.disconnects,
            &self.detaches,
            &self.reattaches,
            &self.snapshots_created,
            &self.persistence_failures,
            &self.mqtt_connection_attempts,
            &self.mqtt_messages_published,
            &self.mqtt_publish_failures,
            &self.mqtt_messages_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.run_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.agent_stats.lock() {
            stats.clear();
        }
    }

    fn run_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.run_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    fn agent_snapshots(&self) -> HashMap<String, AgentStatsSnapshot> {
        let Ok(stats) = self.agent_stats.lock() else {
            return HashMap::new();
        };
        stats
            .iter()
            .map(|(agent_id, stats)| {
                let mut sorted = stats.latencies.clone();
                sorted.sort_unstable();
                let avg = if sorted.is_empty() {
                    0.0
                } else {
                    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
                };
                let success_rate = if stats.invocations == 0 {
                    0.0
                } else {
                    (stats.invocations - stats.failures) as f64 / stats.invocations as f64
                };
                (
                    agent_id.clone(),
                    AgentStatsSnapshot {
                        agent_id: agent_id.clone(),
                        invocations: stats.invocations,
                        failures: stats.failures,
                        avg_latency_ms: avg,
                        latency_p95_ms: percentile(&sorted, 95.0),
                        success_rate,
                        last_invocation: stats.last_invocation,
                    },
                )
            })
            .collect()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_run_time_ms, run_time_p50_ms, run_time_p95_ms) = self.run_time_statistics();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MetricsSnapshot {
            processes: ProcessMetrics {
                started: load(&self.processes_started),
                active: load(&self.processes_active),
                completed: load(&self.processes_completed),
                failed: load(&self.processes_failed),
                cancelled: load(&self.processes_cancelled),
                steps_executed: load(&self.steps_executed),
                avg_run_time_ms,
                run_time_p50_ms,
                run_time_p95_ms,
            },
            agents: AgentMetrics {
                per_agent: self.agent_snapshots(),
                retries: load(&self.agent_retries),
                fanout_tasks: load(&self.fanout_tasks),
                fanout_failures: load(&self.fanout_failures),
            },
            input: InputMetrics {
                requested: load(&self.inputs_requested),
                rejected: load(&self.inputs_rejected),
                timeouts: load(&self.input_timeouts),
            },
            resilience: ResilienceMetrics {
                disconnects: load(&self.disconnects),
                detaches: load(&self.detaches),
                reattaches: load(&self.reattaches),
            },
            persistence: PersistenceMetrics {
                snapshots_created: load(&self.snapshots_created),
                failures: load(&self.persistence_failures),
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: load(&self.mqtt_connection_attempts),
                messages_published: load(&self.mqtt_messages_published),
                publish_failures: load(&self.mqtt_publish_failures),
                messages_received: load(&self.mqtt_messages_received),
            },
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            healthy: self.health_status.load(Ordering::Relaxed),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processes: ProcessMetrics,
    pub agents: AgentMetrics,
    pub input: InputMetrics,
    pub resilience: ResilienceMetrics,
    pub persistence: PersistenceMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetrics {
    pub started: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub steps_executed: u64,
    pub avg_run_time_ms: f64,
    pub run_time_p50_ms: f64,
    pub run_time_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub per_agent: HashMap<String, AgentStatsSnapshot>,
    pub retries: u64,
    pub fanout_tasks: u64,
    pub fanout_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatsSnapshot {
    pub agent_id: String,
    pub invocations: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub latency_p95_ms: f64,
    pub success_rate: f64,
    pub last_invocation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputMetrics {
    pub requested: u64,
    pub rejected: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResilienceMetrics {
    pub disconnects: u64,
    pub detaches: u64,
    pub reattaches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistenceMetrics {
    pub snapshots_created: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

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
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_process_metrics() {
        let collector = MetricsCollector::new();

        collector.process_started();
        collector.process_started();
        collector.process_completed(Duration::from_millis(1500));
        collector.process_failed(Duration::from_millis(500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.processes.started, 2);
        assert_eq!(metrics.processes.completed, 1);
        assert_eq!(metrics.processes.failed, 1);
        assert_eq!(metrics.processes.active, 0);
        assert!(metrics.processes.avg_run_time_ms > 900.0);
    }

    #[test]
    fn test_active_count_never_underflows() {
        let collector = MetricsCollector::new();
        collector.process_cancelled(Duration::ZERO);
        assert_eq!(collector.get_metrics().processes.active, 0);
        assert_eq!(collector.get_metrics().processes.cancelled, 1);
    }

    #[test]
    fn test_agent_metrics() {
        let collector = MetricsCollector::new();

        collector.agent_invocation("writer", Duration::from_millis(500), true);
        collector.agent_invocation("writer", Duration::from_millis(300), false);
        collector.agent_retry();

        let metrics = collector.get_metrics();
        let writer = metrics.agents.per_agent.get("writer").unwrap();
        assert_eq!(writer.invocations, 2);
        assert_eq!(writer.failures, 1);
        assert_eq!(writer.success_rate, 0.5);
        assert!(writer.avg_latency_ms > 350.0);
        assert_eq!(metrics.agents.retries, 1);
    }

    #[test]
    fn test_fanout_and_input_counters() {
        let collector = MetricsCollector::new();
        collector.fanout(5, 2);
        collector.input_requested();
        collector.input_rejected();
        collector.input_timeout();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.agents.fanout_tasks, 5);
        assert_eq!(metrics.agents.fanout_failures, 2);
        assert_eq!(metrics.input.requested, 1);
        assert_eq!(metrics.input.rejected, 1);
        assert_eq!(metrics.input.timeouts, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.step_executed();
                        collector.snapshot_created();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.processes.steps_executed, 1000);
        assert_eq!(metrics.persistence.snapshots_created, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.5).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_samples_are_bounded() {
        let mut samples = Vec::new();
        for i in 0..1500 {
            push_bounded(&mut samples, i);
        }
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert_eq!(samples[0], 500);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.process_started();
        collector.mqtt_connection_established();
        collector.agent_invocation("writer", Duration::from_millis(100), true);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.processes.started, 0);
        assert!(!metrics.mqtt.connected);
        assert!(metrics.agents.per_agent.is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new();
        collector.detach();
        let json = serde_json::to_value(collector.get_metrics()).unwrap();
        assert_eq!(json["resilience"]["detaches"], 1);
    }
}
