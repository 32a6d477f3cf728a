//! Builders for test configurations.

#![allow(dead_code)]

use genogate::config::{
    AuthConfig, CatalogConfig, Config, GenomeConfig, HandlesConfig, JobsConfig, LoggingConfig,
    ProviderConfig, SchedulerConfig, StoreConfig, UserConfig,
};

/// Builder for creating `Config` instances.
pub struct ConfigBuilder {
    root: String,
    genomes: Vec<String>,
    users: Vec<UserConfig>,
    jobs: JobsConfig,
    handles: HandlesConfig,
    scheduler: SchedulerConfig,
}

impl ConfigBuilder {
    /// A config with the users `alice` and `bob` and the genome `hg19`.
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            genomes: vec!["hg19".to_string()],
            users: vec![user("alice", "alice-pw", "alice-token"), user("bob", "bob-pw", "bob-token")],
            jobs: JobsConfig {
                // tests drive polling explicitly
                poll_interval_ms: 3_600_000,
                ..JobsConfig::default()
            },
            handles: HandlesConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn genome(mut self, name: &str) -> Self {
        self.genomes.push(name.to_string());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.jobs.poll_interval_ms = ms;
        self
    }

    pub fn merge_timeout_secs(mut self, secs: u64) -> Self {
        self.jobs.merge_timeout_secs = secs;
        self
    }

    pub fn max_tracked_jobs(mut self, max: usize) -> Self {
        self.jobs.max_tracked_jobs = max;
        self
    }

    pub fn database_path(mut self, path: &str) -> Self {
        self.jobs.database_path = Some(path.to_string());
        self
    }

    /// Where the process scheduler writes job output.
    pub fn job_log_dir(mut self, dir: &str) -> Self {
        self.scheduler.log_dir = Some(dir.to_string());
        self
    }

    pub fn bowtie_template(mut self, command: &str) -> Self {
        self.scheduler.templates.bowtie = command.to_string();
        self
    }

    pub fn vcf_merge_template(mut self, command: &str) -> Self {
        self.scheduler.templates.vcf_merge = command.to_string();
        self
    }

    pub fn read_chunk_bytes(mut self, bytes: usize) -> Self {
        self.handles.read_chunk_bytes = bytes;
        self
    }

    pub fn build(self) -> Config {
        Config {
            version: "1.0".to_string(),
            store: StoreConfig {
                root: self.root,
                home_prefix: "user".to_string(),
            },
            catalog: CatalogConfig {
                index_repo: "/genomes".to_string(),
                refresh_interval_secs: 0,
                genomes: self
                    .genomes
                    .into_iter()
                    .map(|name| GenomeConfig {
                        name,
                        path: "/genomes".to_string(),
                    })
                    .collect(),
            },
            jobs: self.jobs,
            handles: self.handles,
            auth: AuthConfig {
                token_cache_ttl_secs: 60,
                provider: ProviderConfig::Static { users: self.users },
            },
            scheduler: self.scheduler,
            logging: LoggingConfig::default(),
        }
    }
}

fn user(name: &str, password: &str, token: &str) -> UserConfig {
    UserConfig {
        username: name.to_string(),
        password: Some(password.to_string()),
        token: Some(token.to_string()),
    }
}
