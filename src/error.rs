use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("invalid accession code: {0}")]
    InvalidAccession(String),

    #[error("job not found: {0}")]
    JobNotFound(u64),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("sample not found: {0}")]
    SampleNotFound(String),

    #[error("original file not found: {0}")]
    OriginalFileNotFound(u64),

    #[error("job {job_id} is a {actual} job, cannot run it as {expected}")]
    JobKindMismatch {
        job_id: u64,
        expected: String,
        actual: String,
    },

    #[error("job {job_id} already finished as {state}")]
    JobTerminal { job_id: u64, state: String },

    #[error("Could not find QN target for Organism: {0}")]
    MissingNormalizationTarget(String),

    #[error("invalid frame {path}: {message}")]
    InvalidFrame { path: String, message: String },

    #[error("invalid normalization target {path}: {message}")]
    InvalidReference { path: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("failed to write metadata: {0}")]
    Metadata(String),

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("Shell call to {tool} failed because: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("stage {stage} panicked: {message}")]
    StagePanicked { stage: String, message: String },
}
