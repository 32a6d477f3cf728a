use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{JobId, JobSpec};
use crate::error::SchedulerError;

/// Run state as reported by the cluster scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Prep,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Prep => "PREP",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// One job's entry in a poll report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub run_state: RunState,
    pub map_progress: f32,
    pub reduce_progress: f32,
    pub priority: Option<String>,
    pub failure_info: Option<String>,
}

impl JobReport {
    pub fn new(run_state: RunState) -> Self {
        Self {
            run_state,
            map_progress: 0.0,
            reduce_progress: 0.0,
            priority: None,
            failure_info: None,
        }
    }

    pub fn with_progress(mut self, map: f32, reduce: f32) -> Self {
        self.map_progress = map;
        self.reduce_progress = reduce;
        self
    }

    pub fn with_failure(mut self, info: &str) -> Self {
        self.failure_info = Some(info.to_string());
        self
    }
}

/// The cluster scheduler, reduced to what the gateway needs.
pub trait ExternalScheduler: Send + Sync {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError>;

    /// Reports on the given jobs. An id missing from the result has vanished from the scheduler.
    fn poll(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobReport>, SchedulerError>;
}
