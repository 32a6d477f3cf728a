//! Job state-change broadcasting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{JobId, JobRecord, JobState};

/// Emitted whenever a job enters a new state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub owner: String,
    pub state: JobState,
    pub map_progress: f32,
    pub reduce_progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            owner: record.owner.clone(),
            state: record.state,
            map_progress: record.map_progress,
            reduce_progress: record.reduce_progress,
            failure_info: record.failure_info.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::PipelineKind;

    #[test]
    fn test_subscriber_receives_event() {
        let broadcaster = JobEventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        let record = JobRecord {
            job_id: JobId::new("job_1"),
            owner: "alice".to_string(),
            job_name: "n".to_string(),
            kind: PipelineKind::SnpSamtools,
            submit_time: Utc::now(),
            seq: 0,
            priority: "NORMAL".to_string(),
            state: JobState::Running,
            map_progress: 0.25,
            reduce_progress: 0.0,
            failure_info: None,
            finished_at: None,
        };
        broadcaster.send(JobEvent::from_record(&record));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, JobId::new("job_1"));
        assert_eq!(event.state, JobState::Running);
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = JobEventBroadcaster::default();
        let record_event = JobEvent {
            job_id: JobId::new("job_2"),
            owner: "bob".to_string(),
            state: JobState::Failed,
            map_progress: 0.0,
            reduce_progress: 0.0,
            failure_info: Some("ExternalToolError: boom".to_string()),
            timestamp: Utc::now(),
        };
        broadcaster.send(record_event);
    }
}
