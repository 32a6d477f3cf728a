//! Runs job commands as local `sh -c` processes.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::scheduler::{ExternalScheduler, JobReport, RunState};
use super::{JobId, JobSpec};
use crate::error::SchedulerError;

/// Bytes of captured output kept for failure info.
const OUTPUT_TAIL_BYTES: u64 = 4096;

enum ProcState {
    Queued,
    Running(Child),
    Finished {
        failure: Option<String>,
        /// Poll round in which the result was first handed out.
        reported_in: Option<u64>,
    },
}

struct ProcJob {
    name: String,
    command: String,
    owner: String,
    env: Vec<(String, String)>,
    state: ProcState,
}

struct Inner {
    jobs: HashMap<JobId, ProcJob>,
    queue: VecDeque<JobId>,
    next_seq: u64,
    round: u64,
}

/// [`ExternalScheduler`] that runs each job's rendered command with `sh -c`.
///
/// At most `max_concurrent` processes run at once; the rest wait in `Prep`. Output goes to
/// `<log_dir>/<job id>.out` and `.err`.
pub struct ProcessScheduler {
    work_dir: PathBuf,
    log_dir: PathBuf,
    max_concurrent: usize,
    /// Start time stamp shared by every id this scheduler hands out.
    stamp: String,
    inner: Mutex<Inner>,
}

impl ProcessScheduler {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        work_dir: P,
        log_dir: Q,
        max_concurrent: usize,
    ) -> Result<Self, SchedulerError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir).map_err(|e| {
            SchedulerError::Unavailable(format!(
                "cannot create job log directory {}: {}",
                log_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            log_dir,
            max_concurrent: max_concurrent.max(1),
            stamp: Utc::now().format("%Y%m%d%H%M").to_string(),
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                next_seq: 1,
                round: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Process scheduler lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn log_paths(&self, id: &JobId) -> (PathBuf, PathBuf) {
        (
            self.log_dir.join(format!("{}.out", id)),
            self.log_dir.join(format!("{}.err", id)),
        )
    }

    fn spawn(&self, id: &JobId, job: &ProcJob) -> std::io::Result<Child> {
        let (out_path, err_path) = self.log_paths(id);
        let stdout = File::create(out_path)?;
        let stderr = File::create(err_path)?;

        Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .current_dir(&self.work_dir)
            .env("GENOGATE_JOB_ID", id.as_str())
            .env("GENOGATE_JOB_NAME", &job.name)
            .env("GENOGATE_JOB_OWNER", &job.owner)
            .envs(job.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }

    /// Collects finished processes and starts queued jobs while slots are free.
    fn advance(&self, inner: &mut Inner) {
        let mut running = 0;
        for (id, job) in inner.jobs.iter_mut() {
            let ProcState::Running(child) = &mut job.state else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let failure = if status.success() {
                        None
                    } else {
                        Some(self.failure_info(id, status))
                    };
                    log::debug!("Process for {} exited with {}", id, status);
                    job.state = ProcState::Finished {
                        failure,
                        reported_in: None,
                    };
                }
                Ok(None) => running += 1,
                Err(e) => {
                    log::warn!("Cannot query process for {}: {}", id, e);
                    running += 1;
                }
            }
        }

        while running < self.max_concurrent {
            let Some(id) = inner.queue.pop_front() else {
                break;
            };
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            match self.spawn(&id, job) {
                Ok(child) => {
                    log::info!("Started {} ({})", id, job.name);
                    job.state = ProcState::Running(child);
                    running += 1;
                }
                Err(e) => {
                    log::error!("Failed to start {}: {}", id, e);
                    job.state = ProcState::Finished {
                        failure: Some(format!("failed to start command: {}", e)),
                        reported_in: None,
                    };
                }
            }
        }
    }

    /// Failure description built from the captured output, or the exit status if there is none.
    fn failure_info(&self, id: &JobId, status: ExitStatus) -> String {
        let (out_path, err_path) = self.log_paths(id);
        let stderr = read_tail(&err_path);
        let stdout = read_tail(&out_path);

        let exit = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, true) => format!("Command failed with {}", exit),
            (true, false) => format!("{}: {}", exit, stdout),
            (false, true) => format!("{}: {}", exit, stderr),
            (false, false) => format!("{}: {}\n{}", exit, stderr, stdout),
        }
    }
}

/// Job parameters handed to the command as environment variables.
///
/// Each `params` entry becomes `GENOGATE_PARAM_<NAME>`; archives are listed comma-separated in
/// `GENOGATE_ARCHIVES` and the reduce task count, if any, in `GENOGATE_REDUCE_TASKS`.
fn job_env(spec: &JobSpec) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = spec
        .params
        .iter()
        .map(|(name, value)| {
            let name: String = name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            (format!("GENOGATE_PARAM_{}", name), value.clone())
        })
        .collect();
    if !spec.archives.is_empty() {
        env.push(("GENOGATE_ARCHIVES".to_string(), spec.archives.join(",")));
    }
    if let Some(tasks) = spec.reduce_tasks {
        env.push(("GENOGATE_REDUCE_TASKS".to_string(), tasks.to_string()));
    }
    env
}

fn read_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > OUTPUT_TAIL_BYTES && file.seek(SeekFrom::End(-(OUTPUT_TAIL_BYTES as i64))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

impl ExternalScheduler for ProcessScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        if spec.command.trim().is_empty() {
            return Err(SchedulerError::Rejected {
                name: spec.name.clone(),
                reason: "empty command".to_string(),
            });
        }
        let env = job_env(spec);
        let mut inner = self.lock();
        let id = JobId::new(format!("job_{}_{:04}", self.stamp, inner.next_seq));
        inner.next_seq += 1;

        inner.jobs.insert(
            id.clone(),
            ProcJob {
                name: spec.name.clone(),
                command: spec.command.clone(),
                owner: spec.owner.clone(),
                env,
                state: ProcState::Queued,
            },
        );
        inner.queue.push_back(id.clone());
        self.advance(&mut inner);

        Ok(id)
    }

    fn poll(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobReport>, SchedulerError> {
        let mut inner = self.lock();
        inner.round += 1;
        let round = inner.round;

        // A finished job stays answerable for the round after its first report, then goes.
        inner.jobs.retain(|_, job| match job.state {
            ProcState::Finished {
                reported_in: Some(first),
                ..
            } => round <= first + 1,
            _ => true,
        });
        self.advance(&mut inner);

        let mut reports = HashMap::new();
        for id in ids {
            let Some(job) = inner.jobs.get_mut(id) else {
                continue;
            };
            let report = match &mut job.state {
                ProcState::Queued => JobReport::new(RunState::Prep),
                ProcState::Running(_) => JobReport::new(RunState::Running),
                ProcState::Finished {
                    failure,
                    reported_in,
                } => {
                    reported_in.get_or_insert(round);
                    match failure {
                        None => JobReport::new(RunState::Succeeded).with_progress(1.0, 1.0),
                        Some(info) => {
                            JobReport::new(RunState::Failed).with_failure(info.as_str())
                        }
                    }
                }
            };
            reports.insert(id.clone(), report);
        }

        Ok(reports)
    }
}
