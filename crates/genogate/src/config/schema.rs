use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub store: StoreConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub handles: HandlesConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Local directory that backs the store namespace.
    pub root: String,
    /// Relative paths resolve under `<home_prefix>/<username>`.
    #[serde(default = "default_home_prefix")]
    pub home_prefix: String,
}

fn default_home_prefix() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Store directory scanned for `<genome>_samtools.tar.gz` index archives.
    #[serde(default = "default_index_repo")]
    pub index_repo: String,
    /// `0` disables periodic rescans.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub genomes: Vec<GenomeConfig>,
}

fn default_index_repo() -> String {
    "/genomes".to_string()
}

fn default_refresh_interval() -> u64 {
    300
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_repo: default_index_repo(),
            refresh_interval_secs: default_refresh_interval(),
            genomes: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenomeConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Upper bound on non-terminal jobs tracked at once.
    #[serde(default = "default_max_tracked_jobs")]
    pub max_tracked_jobs: usize,
    #[serde(default = "default_true")]
    pub enforce_ownership: bool,
    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_secs: u64,
    /// Finished jobs stay queryable this long before they are dropped.
    #[serde(default = "default_finished_retention")]
    pub finished_retention_secs: u64,
    /// SQLite file used to carry pending jobs across restarts.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_reduce_tasks")]
    pub snp_reduce_tasks: u32,
    #[serde(default = "default_bin_size")]
    pub genome_bin_size: u64,
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_max_tracked_jobs() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_merge_timeout() -> u64 {
    3600
}

fn default_finished_retention() -> u64 {
    86_400
}

fn default_reduce_tasks() -> u32 {
    1024
}

fn default_bin_size() -> u64 {
    1_000_000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_tracked_jobs: default_max_tracked_jobs(),
            enforce_ownership: true,
            merge_timeout_secs: default_merge_timeout(),
            finished_retention_secs: default_finished_retention(),
            database_path: None,
            snp_reduce_tasks: default_reduce_tasks(),
            genome_bin_size: default_bin_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlesConfig {
    #[serde(default = "default_read_chunk")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,
}

fn default_read_chunk() -> usize {
    2_000_000
}

fn default_idle_timeout() -> u64 {
    240
}

fn default_reap_interval() -> u64 {
    60
}

fn default_max_open_handles() -> usize {
    4096
}

impl Default for HandlesConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: default_read_chunk(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            max_open_handles: default_max_open_handles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_ttl")]
    pub token_cache_ttl_secs: u64,
    #[serde(default)]
    pub provider: ProviderConfig,
}

fn default_token_ttl() -> u64 {
    600
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_cache_ttl_secs: default_token_ttl(),
            provider: ProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Static {
        #[serde(default)]
        users: Vec<UserConfig>,
    },
    Http {
        url: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Static { users: vec![] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Working directory for launched jobs; defaults to the store root.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Where job stdout/stderr are captured; defaults to a directory under the system temp dir.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub templates: TemplatesConfig,
}

fn default_max_concurrent() -> usize {
    num_cpus::get()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            log_dir: None,
            max_concurrent: default_max_concurrent(),
            templates: TemplatesConfig::default(),
        }
    }
}

/// Shell command templates per pipeline.
///
/// Placeholders: `{input}`, `{output}`, `{reference}`, `{opts}`, `{align_opts}`, `{sampe_opts}`,
/// `{alignments}`, `{bin_size}`. Path placeholders are substituted single-quoted and relative to
/// the store root, which is the working directory of launched jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default = "default_bowtie_template")]
    pub bowtie: String,
    #[serde(default = "default_bwa_template")]
    pub bwa: String,
    #[serde(default = "default_samtools_template")]
    pub samtools: String,
    #[serde(default = "default_vcf_merge_template")]
    pub vcf_merge: String,
}

fn default_bowtie_template() -> String {
    "bowtie2 {opts} -x {reference} -U {input} -S {output}".to_string()
}

fn default_bwa_template() -> String {
    "bwa aln {align_opts} {reference} {input} > {output}.sai && \
     bwa samse {sampe_opts} {reference} {output}.sai {input} > {output}"
        .to_string()
}

fn default_samtools_template() -> String {
    "samtools mpileup -uf {reference} {input} | bcftools view -bvcg - > {output}".to_string()
}

fn default_vcf_merge_template() -> String {
    "bcftools merge -o {output} {input}/*.vcf".to_string()
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            bowtie: default_bowtie_template(),
            bwa: default_bwa_template(),
            samtools: default_samtools_template(),
            vcf_merge: default_vcf_merge_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
