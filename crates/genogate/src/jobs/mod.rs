//! Job lifecycle: launching pipelines, tracking them to a terminal state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod scheduler;

pub use events::{JobEvent, JobEventBroadcaster};
pub use launcher::JobLauncher;
pub use process::ProcessScheduler;
pub use registry::JobRegistry;
pub use scheduler::{ExternalScheduler, JobReport, RunState};

/// Identifier assigned by the external scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position in the lifecycle; states never move to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Submitted => 0,
            JobState::Running => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "Submitted",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Submitted" => Some(JobState::Submitted),
            "Running" => Some(JobState::Running),
            "Completed" => Some(JobState::Completed),
            "Failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    AlignBowtie,
    AlignBwa,
    SnpSamtools,
    MergeVcf,
}

impl PipelineKind {
    /// Tool name used in job names.
    pub fn tool(self) -> &'static str {
        match self {
            PipelineKind::AlignBowtie => "bowtie2",
            PipelineKind::AlignBwa => "bwa",
            PipelineKind::SnpSamtools => "snp",
            PipelineKind::MergeVcf => "vcf-merge",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::AlignBowtie => "align_bowtie",
            PipelineKind::AlignBwa => "align_bwa",
            PipelineKind::SnpSamtools => "snp_samtools",
            PipelineKind::MergeVcf => "merge_vcf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "align_bowtie" => Some(PipelineKind::AlignBowtie),
            "align_bwa" => Some(PipelineKind::AlignBwa),
            "snp_samtools" => Some(PipelineKind::SnpSamtools),
            "merge_vcf" => Some(PipelineKind::MergeVcf),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline submission with its fixed parameter shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineRequest {
    AlignBowtie {
        in_path: String,
        organism: String,
        out_path: String,
        opts: String,
    },
    AlignBwa {
        in_path: String,
        organism: String,
        out_path: String,
        align_opts: String,
        sampe_opts: String,
    },
    SnpSamtools {
        in_path: String,
        organism: String,
        out_path: String,
    },
    MergeVcf {
        in_dir: String,
        in_alignments: String,
        out_vcf: String,
    },
}

impl PipelineRequest {
    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineRequest::AlignBowtie { .. } => PipelineKind::AlignBowtie,
            PipelineRequest::AlignBwa { .. } => PipelineKind::AlignBwa,
            PipelineRequest::SnpSamtools { .. } => PipelineKind::SnpSamtools,
            PipelineRequest::MergeVcf { .. } => PipelineKind::MergeVcf,
        }
    }

    pub fn organism(&self) -> Option<&str> {
        match self {
            PipelineRequest::AlignBowtie { organism, .. }
            | PipelineRequest::AlignBwa { organism, .. }
            | PipelineRequest::SnpSamtools { organism, .. } => Some(organism.as_str()),
            PipelineRequest::MergeVcf { .. } => None,
        }
    }

    /// Required path fields as `(name, value)` pairs.
    pub fn required_paths(&self) -> Vec<(&'static str, &str)> {
        match self {
            PipelineRequest::AlignBowtie {
                in_path, out_path, ..
            }
            | PipelineRequest::AlignBwa {
                in_path, out_path, ..
            }
            | PipelineRequest::SnpSamtools {
                in_path, out_path, ..
            } => vec![("inPath", in_path.as_str()), ("outPath", out_path.as_str())],
            PipelineRequest::MergeVcf {
                in_dir,
                in_alignments,
                out_vcf,
            } => vec![
                ("inDir", in_dir.as_str()),
                ("inAlignments", in_alignments.as_str()),
                ("outVCF", out_vcf.as_str()),
            ],
        }
    }

    pub fn input(&self) -> &str {
        match self {
            PipelineRequest::AlignBowtie { in_path, .. }
            | PipelineRequest::AlignBwa { in_path, .. }
            | PipelineRequest::SnpSamtools { in_path, .. } => in_path,
            PipelineRequest::MergeVcf { in_dir, .. } => in_dir,
        }
    }
}

/// What the external scheduler is asked to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub kind: PipelineKind,
    pub owner: String,
    /// Fully rendered shell command.
    pub command: String,
    pub params: BTreeMap<String, String>,
    /// Distributed-cache archives, `path#alias`.
    pub archives: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_tasks: Option<u32>,
}

/// Registry-owned record of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub owner: String,
    pub job_name: String,
    pub kind: PipelineKind,
    pub submit_time: DateTime<Utc>,
    /// Registration order; breaks submit-time ties.
    pub seq: u64,
    pub priority: String,
    pub state: JobState,
    pub map_progress: f32,
    pub reduce_progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Job status as returned over RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub username: String,
    pub failure_info: String,
    pub complete: bool,
    pub running_state: JobState,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    pub priority: String,
    pub map_progress: f32,
    pub reduce_progress: f32,
}

impl From<&JobRecord> for JobStatus {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.to_string(),
            username: record.owner.clone(),
            failure_info: record.failure_info.clone().unwrap_or_default(),
            complete: record.state.is_terminal(),
            running_state: record.state,
            start_time: record.submit_time.timestamp_millis(),
            priority: record.priority.clone(),
            map_progress: record.map_progress,
            reduce_progress: record.reduce_progress,
        }
    }
}
