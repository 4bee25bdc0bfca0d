//! Background continuation records
//!
//! When a channel drops during a resilient step the run keeps going on its
//! own task. A [`BackgroundTask`] records that continuation independently
//! of any connection, so it outlives both the channel and the session.
//! Finished records are kept as a bounded history; the oldest are evicted
//! first and running records are never evicted.

use crate::context::{ProcessId, ProcessStatus};
use crate::steps::Step;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Running,
    Cancelled,
    Error,
    Completed,
}

impl BackgroundStatus {
    /// Final status for a continuation whose run ended with `status`. A run
    /// that stopped at a pause point finished its background work.
    pub fn from_process(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Failed => BackgroundStatus::Error,
            ProcessStatus::Cancelled => BackgroundStatus::Cancelled,
            ProcessStatus::Running => BackgroundStatus::Running,
            ProcessStatus::Completed | ProcessStatus::AwaitingInput => BackgroundStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub task_id: String,
    pub process_id: ProcessId,
    pub detached_at_step: Step,
    pub status: BackgroundStatus,
    /// Times the run lost its channel while this task was live
    pub detach_count: u32,
    pub started_at: DateTime<Utc>,
    pub reattached_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Finished records kept unless configured otherwise
pub const DEFAULT_FINISHED_HISTORY: usize = 64;

pub struct BackgroundTasks {
    tasks: DashMap<String, BackgroundTask>,
    /// Finished task ids, oldest first
    finished: Mutex<VecDeque<String>>,
    history: usize,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::with_history(DEFAULT_FINISHED_HISTORY)
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` finished records
    pub fn with_history(history: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            history,
        }
    }

    /// Record that `process_id` is continuing without a channel. An
    /// existing running task for the same run is reused.
    pub fn detach(&self, process_id: &str, step: Step, existing: Option<&str>) -> String {
        if let Some(task_id) = existing {
            if let Some(mut task) = self.tasks.get_mut(task_id) {
                if task.status == BackgroundStatus::Running {
                    task.detach_count += 1;
                    info!(task_id, process_id, step = %step, "Run detached again");
                    return task_id.to_string();
                }
            }
        }

        let task_id = Uuid::new_v4().to_string();
        self.tasks.insert(
            task_id.clone(),
            BackgroundTask {
                task_id: task_id.clone(),
                process_id: process_id.to_string(),
                detached_at_step: step,
                status: BackgroundStatus::Running,
                detach_count: 1,
                started_at: Utc::now(),
                reattached_at: None,
                finished_at: None,
            },
        );
        info!(task_id = %task_id, process_id, step = %step, "Run continues as background task");
        task_id
    }

    pub fn reattach(&self, task_id: &str) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(mut task) => {
                task.reattached_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, task_id: &str, status: BackgroundStatus) {
        let finished = match self.tasks.get_mut(task_id) {
            Some(mut task) if task.status == BackgroundStatus::Running => {
                task.status = status;
                task.finished_at = Some(Utc::now());
                info!(task_id, process_id = %task.process_id, status = ?status, "Background task finished");
                true
            }
            _ => false,
        };
        if finished {
            self.evict_finished(task_id);
        }
    }

    /// Record `task_id` as finished and drop the oldest finished records
    /// beyond the history bound
    fn evict_finished(&self, task_id: &str) {
        let Ok(mut finished) = self.finished.lock() else {
            return;
        };
        finished.push_back(task_id.to_string());
        while finished.len() > self.history {
            if let Some(oldest) = finished.pop_front() {
                self.tasks.remove(&oldest);
                debug!(task_id = %oldest, "Evicted finished background task");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    pub fn for_process(&self, process_id: &str) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = self
            .tasks
            .iter()
            .filter(|t| t.process_id == process_id)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == BackgroundStatus::Running)
            .count()
    }
}
