//! Records read and written by jobs, and the narrow store interface through
//! which they are persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{
    Accession, AggregateBy, DatasetId, JobId, JobKind, JobState, ResultFileKind, ScaleBy,
    SourceDatabase,
};
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    #[serde(default)]
    pub original_files: Vec<u64>,
    #[serde(default)]
    pub sample: Option<Accession>,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            state: JobState::Pending,
            retry_count: 0,
            failure_reason: None,
            started_at: None,
            ended_at: None,
            dataset_id: None,
            original_files: Vec::new(),
            sample: None,
        }
    }

    pub fn smash(id: JobId, dataset_id: DatasetId) -> Self {
        Self {
            dataset_id: Some(dataset_id),
            ..Self::new(id, JobKind::Smash)
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.started_at = Some(now);
        self.ended_at = None;
    }

    /// Moves the job into its terminal state, clipping the reason to `max_len` chars.
    pub fn finish(&mut self, failure_reason: Option<&str>, max_len: usize, now: DateTime<Utc>) {
        match failure_reason {
            Some(reason) => {
                self.state = JobState::Failed;
                self.failure_reason = Some(truncate_reason(reason, max_len));
            }
            None => {
                self.state = JobState::Succeeded;
                self.failure_reason = None;
            }
        }
        self.ended_at = Some(now);
    }
}

pub fn truncate_reason(reason: &str, max_len: usize) -> String {
    match reason.char_indices().nth(max_len) {
        Some((cut, _)) => reason[..cut].to_string(),
        None => reason.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub location: String,
    pub size_in_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub id: DatasetId,
    /// Experiment accession to the ordered sample accessions requested from it.
    pub data: BTreeMap<Accession, Vec<Accession>>,
    pub aggregate_by: AggregateBy,
    #[serde(default)]
    pub scale_by: ScaleBy,
    #[serde(default = "default_true")]
    pub quantile_normalize: bool,
    #[serde(default)]
    pub quant_sf_only: bool,
    #[serde(default)]
    pub is_processing: bool,
    #[serde(default)]
    pub is_processed: bool,
    #[serde(default)]
    pub is_available: bool,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub output: Option<OutputLocation>,
    #[serde(default)]
    pub expires_on: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl DatasetSpec {
    pub fn new(
        id: DatasetId,
        data: BTreeMap<Accession, Vec<Accession>>,
        aggregate_by: AggregateBy,
    ) -> Self {
        Self {
            id,
            data,
            aggregate_by,
            scale_by: ScaleBy::None,
            quantile_normalize: true,
            quant_sf_only: false,
            is_processing: false,
            is_processed: false,
            is_available: false,
            success: None,
            failure_reason: None,
            email_address: None,
            output: None,
            expires_on: None,
        }
    }

    pub fn experiment_of(&self, sample: &Accession) -> Option<&Accession> {
        self.data
            .iter()
            .find(|(_, samples)| samples.contains(sample))
            .map(|(experiment, _)| experiment)
    }

    pub fn sample_accessions(&self) -> Vec<&Accession> {
        let mut seen = Vec::new();
        for sample in self.data.values().flatten() {
            if !seen.contains(&sample) {
                seen.push(sample);
            }
        }
        seen
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub accession_code: Accession,
    pub organism: String,
    pub source_database: SourceDatabase,
    #[serde(default)]
    pub title: Option<String>,
    /// Flat fields such as platform, technology or manufacturer.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub annotations: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub id: u64,
    /// Samples this file belongs to. One file may cover several samples.
    #[serde(default)]
    pub samples: Vec<Accession>,
    pub filename: String,
    pub path: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_in_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub kind: ResultFileKind,
    #[serde(default)]
    pub organism: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalFile {
    pub id: u64,
    pub source_url: String,
    pub filename: String,
    #[serde(default)]
    pub sample: Option<Accession>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub is_downloaded: bool,
}

pub trait RecordStore: Send + Sync {
    fn job(&self, id: JobId) -> Result<Job, KiraError>;
    fn save_job(&self, job: &Job) -> Result<(), KiraError>;

    fn dataset(&self, id: &DatasetId) -> Result<DatasetSpec, KiraError>;
    fn save_dataset(&self, dataset: &DatasetSpec) -> Result<(), KiraError>;

    fn sample(&self, accession: &Accession) -> Result<Sample, KiraError>;

    fn result_files(&self, sample: &Accession) -> Result<Vec<ResultFile>, KiraError>;
    /// Appends a result file, assigning its id. Result files are never updated.
    fn add_result_file(&self, file: ResultFile) -> Result<ResultFile, KiraError>;
    /// Most recently created normalization target for the organism.
    fn normalization_target(&self, organism: &str) -> Result<Option<ResultFile>, KiraError>;

    fn original_file(&self, id: u64) -> Result<OriginalFile, KiraError>;
    fn save_original_file(&self, file: &OriginalFile) -> Result<(), KiraError>;

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, KiraError>;
}

/// Picks the newest file of `kind`, ties broken by the higher id.
pub fn most_recent_of_kind(files: &[ResultFile], kind: ResultFileKind) -> Option<&ResultFile> {
    files
        .iter()
        .filter(|file| file.kind == kind)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_reason("héllo", 2), "hé");
        assert_eq!(truncate_reason("short", 256), "short");
    }

    #[test]
    fn finish_records_clipped_reason() {
        let mut job = Job::new(JobId::new(1), JobKind::Smash);
        job.start(Utc::now());
        job.finish(Some(&"x".repeat(300)), 256, Utc::now());
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure_reason.as_deref().map(str::len), Some(256));
    }
}
