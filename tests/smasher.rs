use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use serde_json::Value;
use tempfile::TempDir;

use kira_refinery::config::ResolvedConfig;
use kira_refinery::domain::{
    Accession, AggregateBy, DatasetId, JobId, JobState, ResultFileKind, ScaleBy, SourceDatabase,
};
use kira_refinery::fs_util::validate_zip;
use kira_refinery::output::LocalUploader;
use kira_refinery::pipeline::PipelineExecutor;
use kira_refinery::records::{DatasetSpec, Job, RecordStore, ResultFile, Sample};
use kira_refinery::smasher::{NO_FILES_DATASET_REASON, NO_FILES_JOB_REASON, SmashPipeline, work_dir};
use kira_refinery::store::MemoryRecordStore;

struct Fixture {
    _temp: TempDir,
    root: Utf8PathBuf,
    store: MemoryRecordStore,
    config: ResolvedConfig,
    uploader: LocalUploader,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config = ResolvedConfig::with_root(root.clone());
        let uploader = LocalUploader::new(config.results_root.clone());
        Self {
            _temp: temp,
            root,
            store: MemoryRecordStore::new(),
            config,
            uploader,
        }
    }

    fn sample(&self, accession: &str) {
        self.store.insert_sample(Sample {
            accession_code: acc(accession),
            organism: "HOMO_SAPIENS".to_string(),
            source_database: SourceDatabase::Geo,
            title: Some(format!("{accession} title")),
            fields: BTreeMap::new(),
            annotations: Vec::new(),
        });
    }

    fn result(&self, samples: &[&str], kind: ResultFileKind, path: &str, content: &str) {
        self.store.put_bytes(path, content);
        self.store
            .add_result_file(ResultFile {
                id: 0,
                samples: samples.iter().map(|s| acc(s)).collect(),
                filename: path.rsplit('/').next().unwrap().to_string(),
                path: path.to_string(),
                sha256: None,
                size_in_bytes: content.len() as u64,
                created_at: Utc::now(),
                kind,
                organism: Some("HOMO_SAPIENS".to_string()),
            })
            .unwrap();
    }

    fn qn_target(&self) {
        self.result(&[], ResultFileKind::QnTarget, "/qn/HOMO_SAPIENS.tsv", "1\n2\n3\n");
    }

    fn dataset(&self, samples: &[&str], configure: impl FnOnce(&mut DatasetSpec)) {
        let mut dataset = DatasetSpec::new(
            DatasetId::new("ds-1"),
            BTreeMap::from([(acc("GSE1"), samples.iter().map(|s| acc(s)).collect())]),
            AggregateBy::Experiment,
        );
        configure(&mut dataset);
        self.store.insert_dataset(dataset);
        self.store
            .insert_job(Job::smash(JobId::new(1), DatasetId::new("ds-1")));
    }

    fn run(&self) -> kira_refinery::pipeline::JobOutcome {
        let pipeline = SmashPipeline::new(&self.store, &self.config, &self.uploader);
        PipelineExecutor::new(&self.store, &self.config)
            .run(JobId::new(1), &pipeline)
            .unwrap()
    }

    fn aggregated_metadata(&self) -> Value {
        let path = work_dir(&self.config, &DatasetId::new("ds-1"))
            .join("output/aggregated_metadata.json");
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn dataset_record(&self) -> DatasetSpec {
        self.store.dataset(&DatasetId::new("ds-1")).unwrap()
    }
}

fn acc(value: &str) -> Accession {
    value.parse().unwrap()
}

#[test]
fn smashes_normalizes_and_ships_archive() {
    let fixture = Fixture::new();
    for sample in ["GSM1", "GSM2"] {
        fixture.sample(sample);
    }
    fixture.result(&["GSM1"], ResultFileKind::Smashable, "/data/GSM1.tsv", "Name\tTPM\ng1\t1\ng2\t2\ng3\t3\n");
    fixture.result(&["GSM2"], ResultFileKind::Smashable, "/data/GSM2.tsv", "Name\tTPM\ng1\t4\ng2\t5\ng3\t6\n");
    fixture.qn_target();
    fixture.dataset(&["GSM1", "GSM2"], |_| {});

    let outcome = fixture.run();
    assert!(outcome.success, "{:?}", outcome.failure_reason);
    let location = fixture.root.join("results/ds-1.zip");
    assert_eq!(outcome.output_location.as_deref(), Some(location.as_str()));

    let names = validate_zip(&location).unwrap();
    for expected in [
        "GSE1/GSE1.tsv",
        "GSE1/metadata_GSE1.tsv",
        "README.md",
        "LICENSE.TXT",
        "aggregated_metadata.json",
    ] {
        assert!(names.iter().any(|name| name == expected), "missing {expected} in {names:?}");
    }

    let table = std::fs::read_to_string(
        work_dir(&fixture.config, &DatasetId::new("ds-1")).join("output/GSE1/GSE1.tsv"),
    )
    .unwrap();
    assert_eq!(table, "Gene\tGSM1\tGSM2\ng1\t1\t1\ng2\t2\t2\ng3\t3\t3\n");

    let metadata = fixture.aggregated_metadata();
    assert_eq!(metadata["num_samples"], 2);
    assert_eq!(metadata["num_experiments"], 1);
    assert_eq!(metadata["quantile_normalized"], true);
    assert_eq!(metadata["ks_statistic"], 0.0);
    assert!(metadata["ks_warning"].is_null());

    let dataset = fixture.dataset_record();
    assert_eq!(dataset.success, Some(true));
    assert!(dataset.is_processed && dataset.is_available && !dataset.is_processing);
    let output = dataset.output.unwrap();
    assert_eq!(output.location, location.as_str());
    assert_eq!(output.sha256.len(), 64);
    let expires = dataset.expires_on.unwrap();
    assert!(expires > Utc::now() + Duration::days(6));

    assert_eq!(
        fixture.store.job(JobId::new(1)).unwrap().state,
        JobState::Succeeded
    );
}

#[test]
fn quant_only_copies_present_files_without_merging() {
    let fixture = Fixture::new();
    for sample in ["GSM1", "GSM2", "GSM3"] {
        fixture.sample(sample);
    }
    fixture.result(&["GSM1"], ResultFileKind::QuantSf, "/data/GSM1/quant.sf", "Name\tTPM\ng1\t1\n");
    fixture.result(&["GSM3"], ResultFileKind::QuantSf, "/data/GSM3/quant.sf", "Name\tTPM\ng1\t3\n");
    fixture.dataset(&["GSM1", "GSM2", "GSM3"], |dataset| {
        dataset.quant_sf_only = true;
    });

    let outcome = fixture.run();
    assert!(outcome.success, "{:?}", outcome.failure_reason);

    let names = validate_zip(&fixture.root.join("smashed/ds-1.zip")).unwrap();
    let quant_files: Vec<&String> = names.iter().filter(|n| n.ends_with("_quant.sf")).collect();
    assert_eq!(quant_files, ["GSE1/GSM1_quant.sf", "GSE1/GSM3_quant.sf"]);
    assert!(!names.iter().any(|name| name == "GSE1/GSE1.tsv"));

    let metadata = fixture.aggregated_metadata();
    assert_eq!(metadata["num_samples"], 2);
    assert_eq!(metadata["quant_sf_only"], true);
    assert_eq!(metadata["quantile_normalized"], false);
    assert!(metadata["ks_statistic"].is_null());
}

#[test]
fn unsmashable_files_are_reported_and_skipped() {
    let fixture = Fixture::new();
    for sample in ["GSM1", "GSM2", "GSM3"] {
        fixture.sample(sample);
    }
    fixture.result(&["GSM1"], ResultFileKind::Smashable, "/data/GSM1.tsv", "Name\tTPM\ng1\t1\ng2\t2\n");
    fixture.result(&["GSM2"], ResultFileKind::Smashable, "/data/GSM2.tsv", "Name\tTPM\ng1\t4\ng2\t5\n");
    fixture.result(&["GSM3"], ResultFileKind::Smashable, "/data/GSM3.tsv", "Name\tTPM\ng1\tabc\n");
    fixture.qn_target();
    fixture.dataset(&["GSM1", "GSM2", "GSM3"], |dataset| {
        dataset.scale_by = ScaleBy::Minmax;
    });

    let outcome = fixture.run();
    assert!(outcome.success, "{:?}", outcome.failure_reason);
    assert!(outcome.warnings.iter().any(|w| w.contains("GSM3")));

    let metadata = fixture.aggregated_metadata();
    assert_eq!(metadata["num_samples"], 2);
    assert_eq!(metadata["unsmashable_files"], serde_json::json!(["GSM3"]));
    assert_eq!(metadata["scale_by"], "MINMAX");
}

#[test]
fn missing_result_files_fail_job_and_dataset() {
    let fixture = Fixture::new();
    fixture.sample("GSM1");
    fixture.dataset(&["GSM1"], |_| {});

    let outcome = fixture.run();
    assert!(!outcome.success);
    assert_eq!(outcome.failure_reason.as_deref(), Some(NO_FILES_JOB_REASON));

    let dataset = fixture.dataset_record();
    assert_eq!(dataset.success, Some(false));
    assert_eq!(dataset.failure_reason.as_deref(), Some(NO_FILES_DATASET_REASON));
    assert!(!dataset.is_processing);
    assert!(dataset.output.is_none());
}

#[test]
fn missing_normalization_target_is_fatal() {
    let fixture = Fixture::new();
    fixture.sample("GSM1");
    fixture.result(&["GSM1"], ResultFileKind::Smashable, "/data/GSM1.tsv", "Name\tTPM\ng1\t1\n");
    fixture.dataset(&["GSM1"], |_| {});

    let outcome = fixture.run();
    let reason = "Could not find QN target for Organism: HOMO_SAPIENS";
    assert_eq!(outcome.failure_reason.as_deref(), Some(reason));
    assert_eq!(fixture.dataset_record().failure_reason.as_deref(), Some(reason));
    assert!(!fixture.root.join("smashed/ds-1.zip").exists());
}

#[test]
fn stale_work_directory_is_cleared() {
    let fixture = Fixture::new();
    let stale = work_dir(&fixture.config, &DatasetId::new("ds-1")).join("output/OLD/OLD.tsv");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "old").unwrap();

    fixture.sample("GSM1");
    fixture.result(&["GSM1"], ResultFileKind::Smashable, "/data/GSM1.tsv", "Name\tTPM\ng1\t1\n");
    fixture.dataset(&["GSM1"], |dataset| dataset.quantile_normalize = false);

    let outcome = fixture.run();
    assert!(outcome.success, "{:?}", outcome.failure_reason);
    assert!(!stale.exists());
    let names = validate_zip(&fixture.root.join("smashed/ds-1.zip")).unwrap();
    assert!(!names.iter().any(|name| name.starts_with("OLD/")));
}

#[test]
fn file_shared_by_samples_is_smashed_once_under_the_first() {
    let fixture = Fixture::new();
    for sample in ["GSM1", "GSM2", "GSM3"] {
        fixture.sample(sample);
    }
    fixture.result(&["GSM1", "GSM2"], ResultFileKind::Smashable, "/data/shared.tsv", "Name\tTPM\ng1\t1\ng2\t2\n");
    fixture.result(&["GSM3"], ResultFileKind::Smashable, "/data/GSM3.tsv", "Name\tTPM\ng1\t3\ng2\t4\n");
    fixture.dataset(&["GSM1", "GSM2", "GSM3"], |dataset| dataset.quantile_normalize = false);

    let outcome = fixture.run();
    assert!(outcome.success, "{:?}", outcome.failure_reason);

    let table = std::fs::read_to_string(
        work_dir(&fixture.config, &DatasetId::new("ds-1")).join("output/GSE1/GSE1.tsv"),
    )
    .unwrap();
    assert_eq!(table.lines().next(), Some("Gene\tGSM1\tGSM3"));
    let metadata = fixture.aggregated_metadata();
    assert_eq!(metadata["num_samples"], 2);
    assert_eq!(metadata["unsmashable_files"], serde_json::json!([]));
}

#[test]
fn archive_failure_fails_job_and_keeps_partial_output() {
    let fixture = Fixture::new();
    fixture.sample("GSM1");
    fixture.result(&["GSM1"], ResultFileKind::Smashable, "/data/GSM1.tsv", "Name\tTPM\ng1\t1\n");
    fixture.dataset(&["GSM1"], |dataset| dataset.quantile_normalize = false);
    std::fs::create_dir_all(fixture.root.join("smashed/ds-1.zip")).unwrap();

    let outcome = fixture.run();
    assert!(!outcome.success);
    let reason = outcome.failure_reason.unwrap();
    assert!(reason.starts_with("archive error"), "{reason}");

    let job = fixture.store.job(JobId::new(1)).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some(reason.as_str()));

    let dataset = fixture.dataset_record();
    assert_eq!(dataset.success, Some(false));
    assert!(dataset.failure_reason.unwrap().starts_with("archive error"));
    assert!(dataset.output.is_none());

    let output = work_dir(&fixture.config, &DatasetId::new("ds-1")).join("output");
    assert!(output.join("GSE1/GSE1.tsv").exists());
    assert!(output.join("aggregated_metadata.json").exists());
}
