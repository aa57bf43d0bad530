//! Smash jobs: merge the result files of a dataset's samples into one table
//! per aggregation key, normalize, scale, attach metadata and ship the archive.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{DatasetId, JobKind};
use crate::error::KiraError;
use crate::frame::{FrameBuilder, MergedTable};
use crate::fs_util;
use crate::locator::{LocatedFiles, ResultFileLocator, aggregated_samples};
use crate::merge::{MergeEngine, MergeReport};
use crate::metadata::{AggregatedMetadata, MetadataCompiler};
use crate::normalize::{ReferenceDistribution, quantile_normalize, validate};
use crate::output::ArtifactUploader;
use crate::package::{OutputPackager, PackagedArchive};
use crate::pipeline::{ContextCore, JobContext, Pipeline, Stage};
use crate::records::{
    DatasetSpec, Job, OutputLocation, RecordStore, ResultFile, Sample, truncate_reason,
};
use crate::scale::scale_features;

pub const NO_FILES_JOB_REASON: &str =
    "Couldn't get any files to smash for Smash job - empty all_sample_files";
pub const NO_FILES_DATASET_REASON: &str = "Couldn't get any files to smash for Smash job!!";
pub const NOTHING_SMASHED_REASON: &str = "None of the located files could be smashed";

pub struct SmashContext {
    core: ContextCore,
    pub dataset: DatasetSpec,
    pub samples: BTreeMap<String, Vec<Sample>>,
    pub input_files: LocatedFiles,
    pub work_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    frames: FrameBuilder,
    pub unsmashable: Vec<String>,
    pub num_samples: usize,
    pub ks_statistic: Option<f64>,
    pub ks_pvalue: Option<f64>,
    pub ks_warning: Option<String>,
    /// Archive-relative paths written so far.
    pub files: Vec<String>,
    pub archive: Option<PackagedArchive>,
    pub result_location: Option<String>,
    /// Reason stored on the dataset when it differs from the job's.
    dataset_failure_reason: Option<String>,
}

impl SmashContext {
    fn new(job: Job, dataset: DatasetSpec, work_dir: Utf8PathBuf) -> Self {
        Self {
            core: ContextCore::new(job),
            output_dir: work_dir.join("output"),
            work_dir,
            dataset,
            samples: BTreeMap::new(),
            input_files: LocatedFiles::default(),
            frames: FrameBuilder::new(),
            unsmashable: Vec::new(),
            num_samples: 0,
            ks_statistic: None,
            ks_pvalue: None,
            ks_warning: None,
            files: Vec::new(),
            archive: None,
            result_location: None,
            dataset_failure_reason: None,
        }
    }

    /// Records a key's merge warnings and rolled-back frames. Frames skipped
    /// for a repeated column are only logged.
    fn absorb_merge(&mut self, report: MergeReport) -> Option<MergedTable> {
        self.unsmashable.extend(report.unsmashable);
        for warning in report.warnings {
            self.core.warn(warning);
        }
        report.table
    }
}

impl JobContext for SmashContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }

    fn output_location(&self) -> Option<String> {
        self.result_location.clone()
    }
}

pub struct SmashPipeline<'a, S: RecordStore, U: ArtifactUploader + ?Sized> {
    store: &'a S,
    config: &'a ResolvedConfig,
    uploader: &'a U,
}

impl<'a, S: RecordStore, U: ArtifactUploader + ?Sized> SmashPipeline<'a, S, U> {
    pub fn new(store: &'a S, config: &'a ResolvedConfig, uploader: &'a U) -> Self {
        Self {
            store,
            config,
            uploader,
        }
    }

    fn packager(&self, context: &SmashContext) -> OutputPackager<'a> {
        OutputPackager::new(self.config, context.output_dir.clone())
    }

    fn prepare_files(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        fs_util::reset_dir(&context.work_dir)?;
        fs_util::reset_dir(&context.output_dir)?;

        context.samples = aggregated_samples(self.store, &context.dataset)?;
        let locator = ResultFileLocator::new(self.store, context.dataset.quant_sf_only);
        context.input_files = locator.locate(&context.samples)?;

        if !context.input_files.found_any {
            warn!(
                job_id = %context.core.job_id(),
                dataset_id = %context.dataset.id,
                "no result files found for dataset"
            );
            context.dataset_failure_reason = Some(NO_FILES_DATASET_REASON.to_string());
            context.core.fail(NO_FILES_JOB_REASON);
            return Ok(());
        }
        info!(
            job_id = %context.core.job_id(),
            keys = context.input_files.by_key.len(),
            files = context.input_files.num_files(),
            "located result files"
        );
        Ok(())
    }

    fn smash_all(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        let packager = self.packager(context);
        let keys: Vec<String> = context.input_files.by_key.keys().cloned().collect();
        for key in keys {
            if context.dataset.quant_sf_only {
                self.copy_quant_files(context, &packager, &key)?;
            } else {
                self.smash_key(context, &packager, &key)?;
            }
        }

        if context.num_samples == 0 {
            context.dataset_failure_reason = Some(NOTHING_SMASHED_REASON.to_string());
            context.core.fail(NOTHING_SMASHED_REASON);
        }
        Ok(())
    }

    fn copy_quant_files(
        &self,
        context: &mut SmashContext,
        packager: &OutputPackager<'_>,
        key: &str,
    ) -> Result<(), KiraError> {
        let files = context.input_files.by_key.get(key).cloned().unwrap_or_default();
        for (file, sample) in files {
            let accession = sample.accession_code.to_string();
            let content = match self.store.read_bytes(&file.path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(key, sample = %accession, error = %err, "quant file unreadable");
                    context
                        .core
                        .warn(format!("Could not read {} for {accession}", file.filename));
                    context.unsmashable.push(accession);
                    continue;
                }
            };
            let path = packager.copy_quant_file(key, &accession, &content)?;
            context.files.push(packager.relative(&path));
            context.num_samples += 1;
        }
        debug!(key, num_samples = context.num_samples, "copied quant files");
        Ok(())
    }

    fn smash_key(
        &self,
        context: &mut SmashContext,
        packager: &OutputPackager<'_>,
        key: &str,
    ) -> Result<(), KiraError> {
        let files = context.input_files.by_key.get(key).cloned().unwrap_or_default();
        let mut frames = Vec::with_capacity(files.len());
        let mut warnings = Vec::new();
        for (file, sample) in &files {
            let accession = sample.accession_code.to_string();
            match context.frames.load(self.store, file, &accession, &mut warnings) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    warn!(key, sample = %accession, error = %err, "unsmashable result file");
                    warnings.push(format!("Unsmashable file {} for {accession}: {err}", file.filename));
                    context.unsmashable.push(accession);
                }
            }
        }
        for warning in warnings {
            context.core.warn(warning);
        }

        if frames.is_empty() {
            warn!(key, "no frames to smash");
            return Ok(());
        }

        let Some(mut table) = context.absorb_merge(MergeEngine::merge(key, frames)) else {
            return Ok(());
        };

        if context.dataset.quantile_normalize {
            table = self.normalize(context, key, &files, table)?;
        }
        let table = scale_features(&table, context.dataset.scale_by);

        let path = packager.write_table(key, &table)?;
        context.files.push(packager.relative(&path));
        context.num_samples += table.num_columns();
        info!(
            key,
            features = table.num_rows(),
            samples = table.num_columns(),
            "smashed key"
        );
        Ok(())
    }

    fn normalize(
        &self,
        context: &mut SmashContext,
        key: &str,
        files: &[(ResultFile, Sample)],
        table: MergedTable,
    ) -> Result<MergedTable, KiraError> {
        let organism = files
            .first()
            .map(|(_, sample)| sample.organism.clone())
            .unwrap_or_default();
        let target = self
            .store
            .normalization_target(&organism)?
            .ok_or_else(|| KiraError::MissingNormalizationTarget(organism.clone()))?;
        let reference =
            ReferenceDistribution::parse(&target.path, &self.store.read_bytes(&target.path)?)?;
        debug!(key, organism = %organism, target = %target.path, "quantile normalizing");

        let normalized = quantile_normalize(&table, &reference);
        if self.config.validation.enabled {
            let report = validate(&normalized, &self.config.validation);
            if report.pairs_tested > 0 {
                context.ks_statistic = report.ks_statistic;
                context.ks_pvalue = report.ks_pvalue;
            }
            if let Some(warning) = report.warning {
                warn!(key, warning = %warning, "normalization validation");
                context.ks_warning = Some(warning.clone());
                context.core.warn(warning);
            }
        }
        Ok(normalized)
    }

    fn write_metadata(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        let packager = self.packager(context);
        let mut samples: Vec<Sample> = Vec::new();
        for sample in context.samples.values().flatten() {
            if !samples.iter().any(|s| s.accession_code == sample.accession_code) {
                samples.push(sample.clone());
            }
        }

        let compiled = MetadataCompiler::compile(&context.dataset, &samples);
        let keys: Vec<String> = context.samples.keys().cloned().collect();
        let tables =
            MetadataCompiler::write_tables(&context.output_dir, &context.dataset, &compiled, &keys)?;
        context
            .files
            .extend(tables.iter().map(|path| packager.relative(path)));
        for path in packager.write_documents()? {
            context.files.push(packager.relative(&path));
        }

        let aggregated = AggregatedMetadata {
            num_samples: context.num_samples,
            num_experiments: compiled.experiments.len(),
            created_at: Utc::now(),
            aggregate_by: context.dataset.aggregate_by,
            scale_by: context.dataset.scale_by,
            quantile_normalized: context.dataset.quantile_normalize
                && !context.dataset.quant_sf_only,
            quant_sf_only: context.dataset.quant_sf_only,
            ks_statistic: context.ks_statistic,
            ks_pvalue: context.ks_pvalue,
            ks_warning: context.ks_warning.clone(),
            unsmashable_files: context.unsmashable.clone(),
            warnings: context.core.warnings().to_vec(),
            samples: compiled.samples,
            experiments: compiled.experiments,
            files: context.files.clone(),
        };
        let path = packager.write_aggregated_metadata(&aggregated)?;
        context.files.push(packager.relative(&path));
        Ok(())
    }

    fn archive(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        let archive = self.packager(context).archive(&context.dataset.id)?;
        context.archive = Some(archive);
        Ok(())
    }

    fn upload(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        let Some(archive) = &context.archive else {
            return Err(KiraError::Archive("no archive to upload".to_string()));
        };
        let location = if self.config.upload {
            self.uploader.upload(&archive.path)?
        } else {
            debug!(path = %archive.path, "upload disabled, keeping local archive");
            archive.path.to_string()
        };
        context.result_location = Some(location);
        Ok(())
    }

    fn update_result_objects(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        let (Some(archive), Some(location)) = (&context.archive, &context.result_location) else {
            return Err(KiraError::Archive("no uploaded archive to record".to_string()));
        };
        let dataset = &mut context.dataset;
        dataset.output = Some(OutputLocation {
            location: location.clone(),
            size_in_bytes: archive.size_in_bytes,
            sha256: archive.sha256.clone(),
        });
        dataset.is_processing = false;
        dataset.is_processed = true;
        dataset.is_available = true;
        dataset.success = Some(true);
        dataset.failure_reason = None;
        dataset.expires_on = Some(Utc::now() + Duration::days(self.config.dataset_expiry_days));
        self.store.save_dataset(dataset)?;
        info!(dataset_id = %dataset.id, location = %location, "dataset available");
        Ok(())
    }
}

impl<'a, S: RecordStore, U: ArtifactUploader + ?Sized> Pipeline for SmashPipeline<'a, S, U> {
    type Context = SmashContext;

    fn kind(&self) -> JobKind {
        JobKind::Smash
    }

    fn prepare(&self, job: Job) -> Result<SmashContext, KiraError> {
        let dataset_id = job
            .dataset_id
            .clone()
            .ok_or_else(|| KiraError::DatasetNotFound(format!("job {} has no dataset", job.id)))?;
        let mut dataset = self.store.dataset(&dataset_id)?;
        dataset.is_processing = true;
        self.store.save_dataset(&dataset)?;

        let work_dir = work_dir(self.config, &dataset_id);
        Ok(SmashContext::new(job, dataset, work_dir))
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![
            Stage::new("prepare_files", Self::prepare_files),
            Stage::new("smash", Self::smash_all),
            Stage::new("write_metadata", Self::write_metadata),
            Stage::new("archive", Self::archive),
            Stage::new("upload", Self::upload),
            Stage::new("update_result_objects", Self::update_result_objects),
        ]
    }

    fn end_job(&self, context: &mut SmashContext) -> Result<(), KiraError> {
        debug!(job_id = %context.core.job_id(), cached_frames = context.frames.cached(), "ending smash job");
        let Some(reason) = context.core.failure_reason().map(str::to_string) else {
            return Ok(());
        };
        let reason = context.dataset_failure_reason.clone().unwrap_or(reason);
        let dataset = &mut context.dataset;
        dataset.is_processing = false;
        dataset.is_available = false;
        dataset.success = Some(false);
        dataset.failure_reason = Some(truncate_reason(&reason, self.config.failure_reason_max_len));
        self.store.save_dataset(dataset)
    }
}

/// Per-dataset scratch directory; the archive itself lands beside it.
pub fn work_dir(config: &ResolvedConfig, dataset_id: &DatasetId) -> Utf8PathBuf {
    config.smashed_root().join(dataset_id.as_str())
}
