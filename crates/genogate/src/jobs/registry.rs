//! The job-lifecycle state machine.
//!
//! Records are created by [`JobRegistry::register`] and afterwards changed only by
//! [`JobRegistry::poll_once`], which the background poller drives. Terminal records never change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::events::{JobEvent, JobEventBroadcaster};
use super::scheduler::{ExternalScheduler, JobReport, RunState};
use super::{JobId, JobRecord, JobSpec, JobState};
use crate::auth::Principal;
use crate::config::schema::JobsConfig;
use crate::error::{GatewayError, Result, SchedulerError};

pub const DEFAULT_PRIORITY: &str = "NORMAL";

const DEFAULT_FINISHED_RETENTION_SECS: u64 = 86_400;

const VANISHED: &str = "ExternalToolError: job vanished from scheduler";

fn as_failure_info(info: &str) -> String {
    if info.starts_with("ExternalToolError:") {
        info.to_string()
    } else {
        format!("ExternalToolError: {}", info)
    }
}

/// Applies one poll observation to a record. Returns `true` if the state changed.
///
/// `report == None` means the scheduler no longer knows the job.
pub fn apply_report(record: &mut JobRecord, report: Option<&JobReport>, now: DateTime<Utc>) -> bool {
    if record.state.is_terminal() {
        return false;
    }
    let before = record.state;

    let Some(report) = report else {
        record.state = JobState::Failed;
        record.failure_info = Some(VANISHED.to_string());
        record.finished_at = Some(now);
        return true;
    };

    record.map_progress = record.map_progress.max(report.map_progress.clamp(0.0, 1.0));
    record.reduce_progress = record
        .reduce_progress
        .max(report.reduce_progress.clamp(0.0, 1.0));
    if let Some(priority) = &report.priority {
        record.priority = priority.clone();
    }

    let failure = report
        .failure_info
        .as_deref()
        .filter(|info| !info.trim().is_empty());

    match report.run_state {
        RunState::Succeeded if failure.is_none() => {
            record.state = JobState::Completed;
            record.map_progress = 1.0;
            record.reduce_progress = 1.0;
            record.finished_at = Some(now);
        }
        RunState::Succeeded | RunState::Failed | RunState::Killed => {
            let info = failure
                .map(as_failure_info)
                .unwrap_or_else(|| as_failure_info(&format!("job {}", report.run_state)));
            record.state = JobState::Failed;
            record.failure_info = Some(info);
            record.finished_at = Some(now);
        }
        RunState::Running => record.state = JobState::Running,
        RunState::Prep => {
            if record.map_progress > 0.0 || record.reduce_progress > 0.0 {
                record.state = JobState::Running;
            }
        }
    }

    record.state != before
}

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    next_seq: AtomicU64,
    draining: AtomicBool,
    max_tracked_jobs: usize,
    enforce_ownership: bool,
    events: JobEventBroadcaster,
    /// How long terminal records stay visible after they finish.
    finished_retention: Duration,
    /// Held for a whole poll round so rounds never overlap.
    poll_round: Mutex<()>,
    /// Bumped whenever a job reaches a terminal state.
    terminal_generation: Mutex<u64>,
    terminal_cv: Condvar,
}

impl JobRegistry {
    pub fn new(config: &JobsConfig, events: JobEventBroadcaster) -> Self {
        Self::with_limits(config.max_tracked_jobs, config.enforce_ownership, events)
            .with_retention(Duration::from_secs(config.finished_retention_secs))
    }

    pub fn with_limits(
        max_tracked_jobs: usize,
        enforce_ownership: bool,
        events: JobEventBroadcaster,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            max_tracked_jobs,
            enforce_ownership,
            events,
            finished_retention: Duration::from_secs(DEFAULT_FINISHED_RETENTION_SECS),
            poll_round: Mutex::new(()),
            terminal_generation: Mutex::new(0),
            terminal_cv: Condvar::new(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    /// Fails if the registry is draining or already tracks the maximum number of live jobs.
    pub fn ensure_accepting(&self) -> Result<()> {
        if self.is_draining() {
            return Err(GatewayError::JobSubmission(
                "gateway is shutting down".to_string(),
            ));
        }
        let active = self.active_count();
        if active >= self.max_tracked_jobs {
            return Err(GatewayError::JobSubmission(format!(
                "too many active jobs ({} of {})",
                active, self.max_tracked_jobs
            )));
        }
        Ok(())
    }

    /// Records a freshly submitted job in the `Submitted` state.
    pub fn register(&self, job_id: JobId, spec: &JobSpec) -> JobRecord {
        let record = JobRecord {
            job_id: job_id.clone(),
            owner: spec.owner.clone(),
            job_name: spec.name.clone(),
            kind: spec.kind,
            submit_time: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            priority: DEFAULT_PRIORITY.to_string(),
            state: JobState::Submitted,
            map_progress: 0.0,
            reduce_progress: 0.0,
            failure_info: None,
            finished_at: None,
        };

        self.write_jobs().insert(job_id, record.clone());
        self.events.send(JobEvent::from_record(&record));
        record
    }

    /// Re-tracks records carried over from a previous run. Terminal or already known ids are
    /// skipped. Returns how many were restored.
    pub fn restore(&self, records: Vec<JobRecord>) -> usize {
        let mut jobs = self.write_jobs();
        let mut restored = 0;
        for record in records {
            if record.state.is_terminal() || jobs.contains_key(&record.job_id) {
                continue;
            }
            self.next_seq.fetch_max(record.seq + 1, Ordering::SeqCst);
            jobs.insert(record.job_id.clone(), record);
            restored += 1;
        }
        restored
    }

    /// Queries the scheduler for every live job and applies the transitions.
    ///
    /// Rounds are serialized: a second caller waits for the running round and then polls the
    /// jobs that are still live. If the scheduler call itself fails nothing changes. Returns the
    /// number of state changes.
    pub fn poll_once(
        &self,
        scheduler: &dyn ExternalScheduler,
    ) -> std::result::Result<usize, SchedulerError> {
        let _round = match self.poll_round.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job poll round lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let span = tracing::info_span!("job_poll");
        let _guard = span.enter();

        let pruned = self.prune_finished(Utc::now());
        if pruned > 0 {
            log::debug!("Dropped {} finished jobs past retention", pruned);
        }

        let ids: Vec<JobId> = self
            .read_jobs()
            .values()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.job_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let reports = scheduler.poll(&ids)?;
        let now = Utc::now();

        let mut events = Vec::new();
        {
            let mut jobs = self.write_jobs();
            for id in &ids {
                let Some(record) = jobs.get_mut(id) else {
                    continue;
                };
                if apply_report(record, reports.get(id), now) {
                    log::info!("Job {} is now {}", id, record.state);
                    events.push(JobEvent::from_record(record));
                }
            }
        }

        let reached_terminal = events.iter().any(|e| e.state.is_terminal());
        let changed = events.len();
        for event in events {
            self.events.send(event);
        }

        if reached_terminal {
            let mut generation = match self.terminal_generation.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *generation += 1;
            self.terminal_cv.notify_all();
        }

        log::debug!("Polled {} jobs, {} changed state", ids.len(), changed);
        Ok(changed)
    }

    /// Drops terminal records that finished longer ago than the retention window.
    fn prune_finished(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.finished_retention) else {
            return 0;
        };
        let mut jobs = self.write_jobs();
        let before = jobs.len();
        jobs.retain(|_, r| match (r.state.is_terminal(), r.finished_at) {
            (true, Some(finished)) => now - finished <= retention,
            _ => true,
        });
        before - jobs.len()
    }

    /// Looks up a job visible to `principal`.
    pub fn get_job_status(&self, job_id: &JobId, principal: &Principal) -> Result<JobRecord> {
        let jobs = self.read_jobs();
        match jobs.get(job_id) {
            Some(record) if !self.enforce_ownership || record.owner == principal.username => {
                Ok(record.clone())
            }
            _ => Err(GatewayError::NotFound(format!("no such job: {}", job_id))),
        }
    }

    /// Jobs owned by `principal`, oldest submission first.
    pub fn all_jobs(&self, principal: &Principal) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .read_jobs()
            .values()
            .filter(|r| r.owner == principal.username)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        records
    }

    pub fn active_count(&self) -> usize {
        self.read_jobs()
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Non-terminal records, in registration order.
    pub fn pending(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .read_jobs()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Blocks until `job_id` is terminal or `timeout` elapses. Returns the record if it finished.
    pub fn wait_for_terminal(&self, job_id: &JobId, timeout: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + timeout;
        let mut generation = match self.terminal_generation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        loop {
            let current = self.read_jobs().get(job_id).cloned()?;
            if current.state.is_terminal() {
                return Some(current);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            generation = match self.terminal_cv.wait_timeout(generation, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
