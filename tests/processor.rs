use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use kira_refinery::config::{QuantToolSettings, ResolvedConfig};
use kira_refinery::domain::{JobId, JobKind, ResultFileKind, SourceDatabase};
use kira_refinery::error::KiraError;
use kira_refinery::pipeline::PipelineExecutor;
use kira_refinery::processor::{ProcessPipeline, QUANT_FILE, QuantTool};
use kira_refinery::records::{Job, OriginalFile, RecordStore, Sample};
use kira_refinery::store::MemoryRecordStore;

const QUANT_SF: &str = "Name\tLength\tEffectiveLength\tTPM\tNumReads\n\
ENST1\t100\t80.0\t12.5\t3\n\
ENST2\t200\t180.0\t0\t0\n";

#[derive(Default)]
struct FakeQuant {
    calls: AtomicUsize,
    stderr: Option<String>,
}

impl QuantTool for FakeQuant {
    fn quantify(
        &self,
        settings: &QuantToolSettings,
        inputs: &[Utf8PathBuf],
        output_dir: &Utf8Path,
    ) -> Result<(), KiraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(inputs.len(), 1);
        if let Some(stderr) = &self.stderr {
            return Err(KiraError::ToolFailed {
                tool: settings.program.clone(),
                message: kira_refinery::processor::stderr_excerpt(stderr),
            });
        }
        fs::write(output_dir.join(QUANT_FILE), QUANT_SF)
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }
}

fn setup(downloaded: bool) -> (tempfile::TempDir, MemoryRecordStore, ResolvedConfig) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let reads = root.join("originals/SRR1/reads.fastq.gz");
    fs::create_dir_all(reads.parent().unwrap()).unwrap();
    fs::write(&reads, "@r1\nACGT\n+\nIIII\n").unwrap();

    let store = MemoryRecordStore::new();
    store.insert_sample(Sample {
        accession_code: "SRR1".parse().unwrap(),
        organism: "DANIO_RERIO".to_string(),
        source_database: SourceDatabase::Sra,
        title: None,
        fields: BTreeMap::new(),
        annotations: Vec::new(),
    });
    store.insert_original_file(OriginalFile {
        id: 1,
        source_url: "https://example.org/reads.fastq.gz".to_string(),
        filename: "reads.fastq.gz".to_string(),
        sample: Some("SRR1".parse().unwrap()),
        local_path: Some(reads.to_string()),
        size_in_bytes: None,
        sha256: None,
        is_downloaded: downloaded,
    });
    let mut job = Job::new(JobId::new(3), JobKind::Process);
    job.original_files = vec![1];
    job.sample = Some("SRR1".parse().unwrap());
    store.insert_job(job);
    (temp, store, ResolvedConfig::with_root(root))
}

#[test]
fn registers_quant_and_smashable_results() {
    let (_temp, store, config) = setup(true);
    let tool = FakeQuant::default();
    let outcome = PipelineExecutor::new(&store, &config)
        .run(JobId::new(3), &ProcessPipeline::new(&store, &config, &tool))
        .unwrap();
    assert!(outcome.success, "{:?}", outcome.failure_reason);

    let files = store.result_files(&"SRR1".parse().unwrap()).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].kind, ResultFileKind::QuantSf);
    assert_eq!(files[1].kind, ResultFileKind::Smashable);
    assert_eq!(files[1].filename, "SRR1_quant.tsv");
    assert_eq!(files[1].organism.as_deref(), Some("DANIO_RERIO"));
    assert_eq!(outcome.output_location.as_deref(), Some(files[1].path.as_str()));

    let table = fs::read_to_string(&files[1].path).unwrap();
    assert_eq!(table, "Name\tTPM\nENST1\t12.5\nENST2\t0\n");
}

#[test]
fn existing_quant_output_is_reused() {
    let (_temp, store, config) = setup(true);
    let output = config.processed_root().join("3");
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join(QUANT_FILE), QUANT_SF).unwrap();

    let tool = FakeQuant::default();
    let outcome = PipelineExecutor::new(&store, &config)
        .run(JobId::new(3), &ProcessPipeline::new(&store, &config, &tool))
        .unwrap();
    assert!(outcome.success);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn tool_failure_reports_error_excerpt() {
    let (_temp, store, config) = setup(true);
    let tool = FakeQuant {
        stderr: Some("[info] loading\nError: index version mismatch".to_string()),
        ..FakeQuant::default()
    };
    let outcome = PipelineExecutor::new(&store, &config)
        .run(JobId::new(3), &ProcessPipeline::new(&store, &config, &tool))
        .unwrap();
    assert_eq!(
        outcome.failure_reason.as_deref(),
        Some("Shell call to salmon failed because: Error: index version mismatch")
    );
    assert!(store.result_files(&"SRR1".parse().unwrap()).unwrap().is_empty());
}

#[test]
fn undownloaded_inputs_fail_before_running_the_tool() {
    let (_temp, store, config) = setup(false);
    let tool = FakeQuant::default();
    let outcome = PipelineExecutor::new(&store, &config)
        .run(JobId::new(3), &ProcessPipeline::new(&store, &config, &tool))
        .unwrap();
    assert_eq!(
        outcome.failure_reason.as_deref(),
        Some("Original file 1 has not been downloaded")
    );
    assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
}
