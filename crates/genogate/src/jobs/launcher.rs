//! Turns pipeline requests into scheduler job specs.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::registry::JobRegistry;
use super::scheduler::ExternalScheduler;
use super::{JobId, JobSpec, PipelineKind, PipelineRequest};
use crate::auth::Principal;
use crate::catalog::{is_valid_genome_name, GenomeCatalog};
use crate::config::schema::{JobsConfig, TemplatesConfig};
use crate::error::{GatewayError, Result};
use crate::store::ExternalStore;

/// Tool options are passed to the shell unquoted, so they are limited to plain flag syntax.
static TOOL_OPTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 _.,:=+/-]*$").unwrap());

/// Quotes `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Store path as seen from the store root, which is the working directory of launched jobs.
fn root_relative(qualified: &str) -> String {
    let trimmed = qualified.trim_start_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Single-pass `{name}` substitution; unknown placeholders are left as written.
fn render(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if values.contains_key(&after[..end]) => {
                out.push_str(&values[&after[..end]]);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct JobLauncher {
    store: Arc<dyn ExternalStore>,
    catalog: Arc<GenomeCatalog>,
    scheduler: Arc<dyn ExternalScheduler>,
    registry: Arc<JobRegistry>,
    templates: TemplatesConfig,
    snp_reduce_tasks: u32,
    genome_bin_size: u64,
}

impl JobLauncher {
    pub fn new(
        store: Arc<dyn ExternalStore>,
        catalog: Arc<GenomeCatalog>,
        scheduler: Arc<dyn ExternalScheduler>,
        registry: Arc<JobRegistry>,
        jobs: &JobsConfig,
        templates: &TemplatesConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            scheduler,
            registry,
            templates: templates.clone(),
            snp_reduce_tasks: jobs.snp_reduce_tasks,
            genome_bin_size: jobs.genome_bin_size,
        }
    }

    /// Validates, submits and registers a pipeline job.
    pub fn submit(&self, request: &PipelineRequest, principal: &Principal) -> Result<JobId> {
        let span = tracing::info_span!(
            "job_submit",
            kind = %request.kind(),
            owner = %principal.username
        );
        let _guard = span.enter();

        self.registry.ensure_accepting()?;
        let spec = self.build_spec(request, principal)?;

        let job_id = self.scheduler.submit(&spec).map_err(|e| {
            log::error!("Submission of {} failed: {}", spec.name, e);
            GatewayError::from(e)
        })?;

        self.registry.register(job_id.clone(), &spec);
        log::info!(
            "Submitted {} job {} for {}",
            spec.kind,
            job_id,
            principal.username
        );
        Ok(job_id)
    }

    /// Builds the job spec for `request` without submitting it.
    pub fn build_spec(&self, request: &PipelineRequest, principal: &Principal) -> Result<JobSpec> {
        for (field, value) in request.required_paths() {
            if value.trim().is_empty() {
                return Err(GatewayError::JobSubmission(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }

        let owner = principal.username.as_str();
        let kind = request.kind();
        let mut values: BTreeMap<&str, String> = BTreeMap::new();
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        let mut archives = Vec::new();
        let mut reduce_tasks = None;

        let (input, output) = match request {
            PipelineRequest::AlignBowtie {
                in_path, out_path, ..
            }
            | PipelineRequest::AlignBwa {
                in_path, out_path, ..
            }
            | PipelineRequest::SnpSamtools {
                in_path, out_path, ..
            } => (in_path.as_str(), out_path.as_str()),
            PipelineRequest::MergeVcf {
                in_dir, out_vcf, ..
            } => (in_dir.as_str(), out_vcf.as_str()),
        };
        let input = self.qualify(input, owner)?;
        let output = self.qualify(output, owner)?;
        values.insert("input", shell_quote(&root_relative(&input)));
        values.insert("output", shell_quote(&root_relative(&output)));
        params.insert("input".to_string(), input);
        params.insert("output".to_string(), output);

        if let Some(organism) = request.organism() {
            let organism = organism.trim();
            if !is_valid_genome_name(organism) {
                return Err(GatewayError::UnknownGenome(organism.to_string()));
            }
            let entry = self
                .catalog
                .get(organism)
                .ok_or_else(|| GatewayError::UnknownGenome(organism.to_string()))?;
            let repo = self.qualify(&entry.indexed_path, owner)?;
            let repo = repo.trim_end_matches('/');

            let reference = format!("{}/{}.fa", repo, organism);
            values.insert("reference", shell_quote(&root_relative(&reference)));
            params.insert("reference".to_string(), reference);

            let (index_archive, alias, tools): (&str, &str, &[&str]) = match kind {
                PipelineKind::AlignBowtie => ("bowtie", "btarchive", &["bowtie"][..]),
                PipelineKind::AlignBwa => ("bwa", "bwaarchive", &["bwa"][..]),
                _ => ("samtools", "starchive", &["samtools", "bcftools"][..]),
            };
            archives.push(format!("{}/{}_{}.tar.gz#{}", repo, organism, index_archive, alias));
            for tool in tools {
                archives.push(format!("{}/{}.tar.gz#{}", repo, tool, tool));
            }
            params.insert("index".to_string(), format!("{}/{}.fa", alias, organism));
        }

        let template = match request {
            PipelineRequest::AlignBowtie { opts, .. } => {
                values.insert("opts", checked_opts("opts", opts)?);
                params.insert("bowtie_opts".to_string(), opts.clone());
                &self.templates.bowtie
            }
            PipelineRequest::AlignBwa {
                align_opts,
                sampe_opts,
                ..
            } => {
                values.insert("align_opts", checked_opts("alignOpts", align_opts)?);
                values.insert("sampe_opts", checked_opts("sampeOpts", sampe_opts)?);
                params.insert("bwa_align_opts".to_string(), align_opts.clone());
                params.insert("bwa_sampe_opts".to_string(), sampe_opts.clone());
                &self.templates.bwa
            }
            PipelineRequest::SnpSamtools { .. } => {
                values.insert("bin_size", self.genome_bin_size.to_string());
                params.insert("genome_binsize".to_string(), self.genome_bin_size.to_string());
                reduce_tasks = Some(self.snp_reduce_tasks);
                &self.templates.samtools
            }
            PipelineRequest::MergeVcf { in_alignments, .. } => {
                let alignments = self.qualify(in_alignments, owner)?;
                values.insert("alignments", shell_quote(&root_relative(&alignments)));
                params.insert("alignments".to_string(), alignments);
                &self.templates.vcf_merge
            }
        };

        Ok(JobSpec {
            name: format!("{}-{}-{}", owner, kind.tool(), request.input()),
            kind,
            owner: owner.to_string(),
            command: render(template, &values),
            params,
            archives,
            reduce_tasks,
        })
    }

    fn qualify(&self, path: &str, owner: &str) -> Result<String> {
        self.store
            .qualify(path, owner)
            .map_err(|e| GatewayError::JobSubmission(e.to_string()))
    }
}

fn checked_opts(field: &str, opts: &str) -> Result<String> {
    if TOOL_OPTS.is_match(opts) {
        Ok(opts.trim().to_string())
    } else {
        Err(GatewayError::JobSubmission(format!(
            "'{}' contains unsupported characters",
            field
        )))
    }
}
