use serde::Serialize;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::domain::{JobId, JobKind};
use crate::downloader::{DownloadPipeline, FileFetcher};
use crate::error::KiraError;
use crate::output::{ArtifactUploader, Notifier};
use crate::pipeline::{JobOutcome, PipelineExecutor};
use crate::processor::{ProcessPipeline, QuantTool};
use crate::records::{DatasetSpec, Job, RecordStore};
use crate::smasher::SmashPipeline;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub dataset: Option<DatasetSpec>,
}

/// Entry point for a scheduler: picks the pipeline for a job's kind and
/// drives the job to completion.
pub struct App<S: RecordStore, F: FileFetcher, T: QuantTool, U: ArtifactUploader> {
    store: S,
    config: ResolvedConfig,
    fetcher: F,
    tool: T,
    uploader: U,
}

impl<S: RecordStore, F: FileFetcher, T: QuantTool, U: ArtifactUploader> App<S, F, T, U> {
    pub fn new(store: S, config: ResolvedConfig, fetcher: F, tool: T, uploader: U) -> Self {
        Self {
            store,
            config,
            fetcher,
            tool,
            uploader,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn run_job(&self, job_id: JobId, notifier: &dyn Notifier) -> Result<JobOutcome, KiraError> {
        let kind = self.store.job(job_id)?.kind;
        info!(job_id = %job_id, kind = %kind, "dispatching job");

        let executor = PipelineExecutor::new(&self.store, &self.config);
        let outcome = match kind {
            JobKind::Download => executor.run(
                job_id,
                &DownloadPipeline::new(&self.store, &self.config, &self.fetcher),
            )?,
            JobKind::Process => executor.run(
                job_id,
                &ProcessPipeline::new(&self.store, &self.config, &self.tool),
            )?,
            JobKind::Smash => executor.run(
                job_id,
                &SmashPipeline::new(&self.store, &self.config, &self.uploader),
            )?,
        };
        notifier.notify(&outcome);
        Ok(outcome)
    }

    pub fn show_job(&self, job_id: JobId) -> Result<JobReport, KiraError> {
        let job = self.store.job(job_id)?;
        let dataset = match &job.dataset_id {
            Some(id) => Some(self.store.dataset(id)?),
            None => None,
        };
        Ok(JobReport { job, dataset })
    }
}
