//! Test harness for isolated gateway tests.
//!
//! `TestHarness` runs a real `Gateway` over a `LocalStore` in a temporary directory. Jobs go to a
//! `ScriptedScheduler`, which plays back a fixed sequence of reports per job.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use genogate::auth::StaticIdentityProvider;
use genogate::config::{Config, ProviderConfig};
use genogate::db::Database;
use genogate::error::SchedulerError;
use genogate::jobs::{ExternalScheduler, JobReport, JobSpec, RunState};
use genogate::{Authenticator, Credential, ExternalStore, Gateway, GatewayParts, JobId, LocalStore};

use super::ConfigBuilder;

struct ScriptedJob {
    spec: JobSpec,
    reports: VecDeque<JobReport>,
}

/// Scheduler that hands out `job_test_<n>` ids and replays scripted reports.
///
/// Each poll pops the next report for a job; the last one repeats. Jobs submitted without a
/// script report `Prep` forever. Forgotten jobs are left out of reports, which reads as vanished.
#[derive(Default)]
pub struct ScriptedScheduler {
    jobs: Mutex<HashMap<JobId, ScriptedJob>>,
    next_script: Mutex<Vec<JobReport>>,
    next_seq: Mutex<u64>,
    reject_submissions: AtomicBool,
    fail_polls: AtomicBool,
}

impl ScriptedScheduler {
    /// Reports played back for every job submitted from now on.
    pub fn script(&self, reports: Vec<JobReport>) {
        *self.next_script.lock().unwrap() = reports;
    }

    /// Replaces the remaining reports of one job.
    pub fn script_job(&self, id: &JobId, reports: Vec<JobReport>) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.reports = reports.into();
        }
    }

    pub fn forget(&self, id: &JobId) {
        self.jobs.lock().unwrap().remove(id);
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .map(|j| j.spec.clone())
            .collect()
    }

    pub fn spec(&self, id: &JobId) -> Option<JobSpec> {
        self.jobs.lock().unwrap().get(id).map(|j| j.spec.clone())
    }
}

impl ExternalScheduler for ScriptedScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                name: spec.name.clone(),
                reason: "queue closed".to_string(),
            });
        }

        let id = {
            let mut seq = self.next_seq.lock().unwrap();
            *seq += 1;
            JobId::new(format!("job_test_{:04}", *seq))
        };
        let reports = self.next_script.lock().unwrap().clone().into();
        self.jobs.lock().unwrap().insert(
            id.clone(),
            ScriptedJob {
                spec: spec.clone(),
                reports,
            },
        );
        Ok(id)
    }

    fn poll(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobReport>, SchedulerError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable("scheduler unreachable".to_string()));
        }

        let mut jobs = self.jobs.lock().unwrap();
        let mut reports = HashMap::new();
        for id in ids {
            let Some(job) = jobs.get_mut(id) else {
                continue;
            };
            let report = if job.reports.len() > 1 {
                job.reports.pop_front()
            } else {
                job.reports.front().cloned()
            };
            reports.insert(
                id.clone(),
                report.unwrap_or_else(|| JobReport::new(RunState::Prep)),
            );
        }
        Ok(reports)
    }
}

/// A gateway over a temporary store.
pub struct TestHarness {
    temp_dir: TempDir,
    pub root: PathBuf,
    pub scheduler: Arc<ScriptedScheduler>,
    pub gateway: Gateway,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|builder| builder)
    }

    /// Builds the harness from a customised config.
    pub fn with_config(customise: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("store");
        std::fs::create_dir_all(&root).expect("Failed to create store root");

        let config = customise(ConfigBuilder::new(&root.to_string_lossy())).build();
        let scheduler = Arc::new(ScriptedScheduler::default());
        let gateway = start_gateway(&config, &root, Arc::clone(&scheduler));

        Self {
            temp_dir,
            root,
            scheduler,
            gateway,
        }
    }

    /// Shuts the gateway down and starts a new one over the same store and database.
    pub fn restart(&mut self, config: &Config) {
        self.gateway.shutdown();
        let scheduler = Arc::new(ScriptedScheduler::default());
        let gateway = start_gateway(config, &self.root, Arc::clone(&scheduler));
        self.gateway = gateway;
        self.scheduler = scheduler;
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn alice(&self) -> Credential {
        Credential::with_password("alice", "alice-pw")
    }

    pub fn bob(&self) -> Credential {
        Credential::with_token("bob", "bob-token")
    }

    /// Writes a file straight into the store's backing directory.
    pub fn put_file(&self, store_path: &str, content: &[u8]) -> PathBuf {
        let local = self.root.join(store_path.trim_start_matches('/'));
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&local, content).expect("Failed to write file");
        local
    }

    pub fn local_path(&self, store_path: &str) -> PathBuf {
        self.root.join(store_path.trim_start_matches('/'))
    }
}

fn start_gateway(config: &Config, root: &Path, scheduler: Arc<ScriptedScheduler>) -> Gateway {
    let store: Arc<dyn ExternalStore> =
        Arc::new(LocalStore::new(root, &config.store.home_prefix));
    let users = match &config.auth.provider {
        ProviderConfig::Static { users } => users.clone(),
        ProviderConfig::Http { .. } => vec![],
    };
    let authenticator = Authenticator::new(
        Arc::new(StaticIdentityProvider::from_users(&users)),
        std::time::Duration::from_secs(config.auth.token_cache_ttl_secs),
    );
    let database = config
        .jobs
        .database_path
        .as_ref()
        .map(|path| Database::open(Path::new(path)).expect("Failed to open database"));

    Gateway::with_parts(
        config,
        GatewayParts {
            store,
            scheduler,
            authenticator,
            database,
        },
    )
}
