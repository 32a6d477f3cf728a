//! The RPC surface.
//!
//! [`Gateway`] owns every component plus the background workers that keep them current: the job
//! poller, the idle-handle reaper and the genome catalog refresh. Each RPC method authenticates the
//! caller first and reports failures as an [`RpcFault`] whose message starts with the error kind.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::auth::{Authenticator, Credential, Principal};
use crate::background::PeriodicWorker;
use crate::catalog::GenomeCatalog;
use crate::config::Config;
use crate::db::{pending_repo, Database};
use crate::directory::DirectoryGateway;
use crate::error::{ErrorKind, GatewayError, Result, StartupError};
use crate::handles::{FileHandle, HandleTable};
use crate::jobs::{
    ExternalScheduler, JobEvent, JobEventBroadcaster, JobId, JobLauncher, JobRegistry, JobState,
    JobStatus, PipelineRequest, ProcessScheduler,
};
use crate::store::{ExternalStore, FileStatus, LocalStore};

/// The only error type an RPC caller sees.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RpcFault {
    pub message: String,
}

impl RpcFault {
    /// Whether the fault carries the given error kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.message
            .strip_prefix(&kind.to_string())
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl From<GatewayError> for RpcFault {
    fn from(err: GatewayError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcFault>;

/// Collaborators the gateway runs against. [`Gateway::start`] builds the local ones from config;
/// tests inject their own.
pub struct GatewayParts {
    pub store: Arc<dyn ExternalStore>,
    pub scheduler: Arc<dyn ExternalScheduler>,
    pub authenticator: Authenticator,
    pub database: Option<Database>,
}

pub struct Gateway {
    authenticator: Authenticator,
    store: Arc<dyn ExternalStore>,
    catalog: Arc<GenomeCatalog>,
    handles: Arc<HandleTable>,
    directory: DirectoryGateway,
    registry: Arc<JobRegistry>,
    scheduler: Arc<dyn ExternalScheduler>,
    launcher: JobLauncher,
    database: Option<Database>,
    merge_timeout: Duration,
    poller: PeriodicWorker,
    maintenance: Vec<PeriodicWorker>,
    shut_down: AtomicBool,
}

impl Gateway {
    /// Starts a gateway backed by a [`LocalStore`] and a [`ProcessScheduler`].
    pub fn start(config: &Config) -> std::result::Result<Self, StartupError> {
        let root = PathBuf::from(&config.store.root);
        std::fs::create_dir_all(&root).map_err(|e| StartupError::StoreRoot {
            path: root.clone(),
            source: e,
        })?;
        let store: Arc<dyn ExternalStore> =
            Arc::new(LocalStore::new(&root, &config.store.home_prefix));

        let work_dir = config
            .scheduler
            .work_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.clone());
        let log_dir = config
            .scheduler
            .log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("genogate-jobs"));
        let scheduler: Arc<dyn ExternalScheduler> = Arc::new(ProcessScheduler::new(
            work_dir,
            log_dir,
            config.scheduler.max_concurrent,
        )?);

        let authenticator = Authenticator::from_config(&config.auth)?;

        let database = match &config.jobs.database_path {
            Some(path) => Some(Database::open(&PathBuf::from(path))?),
            None => None,
        };

        Ok(Self::with_parts(
            config,
            GatewayParts {
                store,
                scheduler,
                authenticator,
                database,
            },
        ))
    }

    /// Wires the components around the given collaborators and starts the background workers.
    pub fn with_parts(config: &Config, parts: GatewayParts) -> Self {
        let GatewayParts {
            store,
            scheduler,
            authenticator,
            database,
        } = parts;

        let catalog = Arc::new(GenomeCatalog::from_config(&config.catalog));
        match catalog.refresh(store.as_ref()) {
            Ok(added) => log::info!(
                "Genome catalog ready: {} genomes ({} discovered)",
                catalog.list_genomes().len(),
                added
            ),
            Err(e) => log::warn!("Initial genome catalog refresh failed: {}", e),
        }

        let handles = Arc::new(HandleTable::new(Arc::clone(&store), &config.handles));
        let directory = DirectoryGateway::new(Arc::clone(&store));
        let registry = Arc::new(JobRegistry::new(&config.jobs, JobEventBroadcaster::default()));

        if let Some(db) = &database {
            match pending_repo::load_all(db) {
                Ok(records) => {
                    let restored = registry.restore(records);
                    if restored > 0 {
                        log::info!("Restored {} pending jobs", restored);
                    }
                }
                Err(e) => log::error!("Failed to load pending jobs: {}", e),
            }
        }

        let launcher = JobLauncher::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            &config.jobs,
            &config.scheduler.templates,
        );

        let poller = {
            let registry = Arc::clone(&registry);
            let scheduler = Arc::clone(&scheduler);
            PeriodicWorker::spawn(
                "job-poller",
                Duration::from_millis(config.jobs.poll_interval_ms),
                move || {
                    if let Err(e) = registry.poll_once(scheduler.as_ref()) {
                        log::warn!("Job poll failed, will retry: {}", e);
                    }
                },
            )
        };

        let mut maintenance = Vec::new();
        {
            let handles = Arc::clone(&handles);
            let idle = Duration::from_secs(config.handles.idle_timeout_secs);
            maintenance.push(PeriodicWorker::spawn(
                "handle-reaper",
                Duration::from_secs(config.handles.reap_interval_secs),
                move || {
                    handles.reap_idle(idle);
                },
            ));
        }
        if config.catalog.refresh_interval_secs > 0 {
            let catalog = Arc::clone(&catalog);
            let store = Arc::clone(&store);
            maintenance.push(PeriodicWorker::spawn(
                "catalog-refresh",
                Duration::from_secs(config.catalog.refresh_interval_secs),
                move || {
                    if let Err(e) = catalog.refresh(store.as_ref()) {
                        log::warn!("Genome catalog refresh failed: {}", e);
                    }
                },
            ));
        }

        Self {
            authenticator,
            store,
            catalog,
            handles,
            directory,
            registry,
            scheduler,
            launcher,
            database,
            merge_timeout: Duration::from_secs(config.jobs.merge_timeout_secs),
            poller,
            maintenance,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Authenticates, runs `op`, and converts its error into a fault.
    fn call<T>(
        &self,
        rpc: &'static str,
        credential: &Credential,
        op: impl FnOnce(&Principal) -> Result<T>,
    ) -> RpcResult<T> {
        let principal = self.authenticator.authenticate(credential).map_err(|e| {
            log::warn!("{}: authentication failed for '{}': {}", rpc, credential.username, e);
            RpcFault::from(GatewayError::from(e))
        })?;

        op(&principal).map_err(|e| {
            log::debug!("{} by {} failed: {}", rpc, principal.username, e);
            RpcFault::from(e)
        })
    }

    // Compute

    pub fn align_bowtie(
        &self,
        credential: &Credential,
        in_path: &str,
        organism: &str,
        out_path: &str,
        opts: &str,
    ) -> RpcResult<JobId> {
        let request = PipelineRequest::AlignBowtie {
            in_path: in_path.to_string(),
            organism: organism.to_string(),
            out_path: out_path.to_string(),
            opts: opts.to_string(),
        };
        self.call("alignBowtie", credential, |p| self.launcher.submit(&request, p))
    }

    pub fn align_bwa(
        &self,
        credential: &Credential,
        in_path: &str,
        organism: &str,
        out_path: &str,
        align_opts: &str,
        sampe_opts: &str,
    ) -> RpcResult<JobId> {
        let request = PipelineRequest::AlignBwa {
            in_path: in_path.to_string(),
            organism: organism.to_string(),
            out_path: out_path.to_string(),
            align_opts: align_opts.to_string(),
            sampe_opts: sampe_opts.to_string(),
        };
        self.call("alignBWA", credential, |p| self.launcher.submit(&request, p))
    }

    pub fn snp_samtools(
        &self,
        credential: &Credential,
        in_path: &str,
        organism: &str,
        out_path: &str,
    ) -> RpcResult<JobId> {
        let request = PipelineRequest::SnpSamtools {
            in_path: in_path.to_string(),
            organism: organism.to_string(),
            out_path: out_path.to_string(),
        };
        self.call("snpSamtools", credential, |p| self.launcher.submit(&request, p))
    }

    /// Submits a VCF merge and blocks until it finishes. Returns whether it completed.
    pub fn merge_vcf(
        &self,
        credential: &Credential,
        in_dir: &str,
        in_alignments: &str,
        out_vcf: &str,
    ) -> RpcResult<bool> {
        let request = PipelineRequest::MergeVcf {
            in_dir: in_dir.to_string(),
            in_alignments: in_alignments.to_string(),
            out_vcf: out_vcf.to_string(),
        };
        self.call("mergeVCF", credential, |p| {
            let job_id = self.launcher.submit(&request, p)?;
            self.poller.trigger();

            match self.registry.wait_for_terminal(&job_id, self.merge_timeout) {
                Some(record) => {
                    if let Some(info) = &record.failure_info {
                        log::warn!("Merge job {} failed: {}", job_id, info);
                    }
                    Ok(record.state == JobState::Completed)
                }
                None => Err(GatewayError::ExternalTool(format!(
                    "merge job {} did not finish within {}s",
                    job_id,
                    self.merge_timeout.as_secs()
                ))),
            }
        })
    }

    // Status

    pub fn get_job_status(&self, credential: &Credential, job_id: &str) -> RpcResult<JobStatus> {
        self.call("getJobStatus", credential, |p| {
            let record = self.registry.get_job_status(&JobId::from(job_id), p)?;
            Ok(JobStatus::from(&record))
        })
    }

    pub fn get_all_jobs(&self, credential: &Credential) -> RpcResult<Vec<JobStatus>> {
        self.call("getAllJobs", credential, |p| {
            Ok(self
                .registry
                .all_jobs(p)
                .iter()
                .map(JobStatus::from)
                .collect())
        })
    }

    // Data

    pub fn create(&self, credential: &Credential, path: &str) -> RpcResult<FileHandle> {
        self.call("create", credential, |p| self.handles.create(path, p))
    }

    pub fn open(&self, credential: &Credential, path: &str) -> RpcResult<FileHandle> {
        self.call("open", credential, |p| self.handles.open(path, p))
    }

    pub fn write(&self, credential: &Credential, handle: &FileHandle, bytes: &[u8]) -> RpcResult<()> {
        self.call("write", credential, |p| self.handles.write(handle, bytes, p))
    }

    pub fn read(&self, credential: &Credential, handle: &FileHandle) -> RpcResult<Vec<u8>> {
        self.call("read", credential, |p| self.handles.read(handle, p))
    }

    pub fn close(&self, credential: &Credential, handle: &FileHandle) -> RpcResult<()> {
        self.call("close", credential, |p| self.handles.close(handle, p))
    }

    pub fn list_status(&self, credential: &Credential, path: &str) -> RpcResult<Vec<FileStatus>> {
        self.call("listStatus", credential, |p| self.directory.list_status(path, p))
    }

    pub fn remove(&self, credential: &Credential, path: &str, recursive: bool) -> RpcResult<bool> {
        self.call("remove", credential, |p| self.directory.remove(path, recursive, p))
    }

    pub fn mkdir(&self, credential: &Credential, path: &str) -> RpcResult<bool> {
        self.call("mkdir", credential, |p| self.directory.mkdir(path, p))
    }

    pub fn mv(&self, credential: &Credential, src: &str, dst: &str) -> RpcResult<bool> {
        self.call("mv", credential, |p| self.directory.mv(src, dst, p))
    }

    pub fn check_file_status(&self, credential: &Credential, path: &str) -> RpcResult<bool> {
        self.call("checkFileStatus", credential, |p| {
            self.directory.check_file_status(path, p)
        })
    }

    pub fn list_genomes(&self, credential: &Credential) -> RpcResult<Vec<String>> {
        self.call("listGenomes", credential, |_| Ok(self.catalog.list_genomes()))
    }

    // Operations

    /// Job state changes, as they are observed by the poller.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.events().subscribe()
    }

    /// Runs one poll round on the calling thread.
    pub fn poll_now(&self) -> usize {
        match self.registry.poll_once(self.scheduler.as_ref()) {
            Ok(changed) => changed,
            Err(e) => {
                log::warn!("Job poll failed: {}", e);
                0
            }
        }
    }

    /// Re-scans the index repository for new genomes.
    pub fn refresh_catalog(&self) -> usize {
        match self.catalog.refresh(self.store.as_ref()) {
            Ok(added) => added,
            Err(e) => {
                log::warn!("Genome catalog refresh failed: {}", e);
                0
            }
        }
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.open_count()
    }

    /// Stops accepting jobs, stops the workers, closes every handle and persists pending jobs.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down gateway");

        self.registry.begin_drain();
        self.poller.stop();
        for worker in &self.maintenance {
            worker.stop();
        }

        let closed = self.handles.close_all();
        if closed > 0 {
            log::info!("Closed {} open handles", closed);
        }

        if let Some(db) = &self.database {
            let pending = self.registry.pending();
            match pending_repo::replace_all(db, &pending) {
                Ok(saved) => log::info!("Saved {} pending jobs", saved),
                Err(e) => log::error!("Failed to save pending jobs: {}", e),
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
