use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::domain::{Accession, DatasetId, JobId, ResultFileKind};
use crate::error::KiraError;
use crate::records::{
    DatasetSpec, Job, OriginalFile, RecordStore, ResultFile, Sample, most_recent_of_kind,
};

/// Record store keeping one pretty-printed JSON document per record.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    root: Utf8PathBuf,
}

impl JsonRecordStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn job_path(&self, id: JobId) -> Utf8PathBuf {
        self.root.join("jobs").join(format!("{id}.json"))
    }

    pub fn dataset_path(&self, id: &DatasetId) -> Result<Utf8PathBuf, KiraError> {
        let name = id.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(KiraError::DatasetNotFound(name.to_string()));
        }
        Ok(self.root.join("datasets").join(format!("{name}.json")))
    }

    pub fn sample_path(&self, accession: &Accession) -> Utf8PathBuf {
        self.root
            .join("samples")
            .join(format!("{}.json", accession.as_str()))
    }

    pub fn result_file_path(&self, id: u64) -> Utf8PathBuf {
        self.root.join("result_files").join(format!("{id}.json"))
    }

    pub fn original_file_path(&self, id: u64) -> Utf8PathBuf {
        self.root.join("original_files").join(format!("{id}.json"))
    }

    pub fn save_sample(&self, sample: &Sample) -> Result<(), KiraError> {
        write_json_atomic(&self.sample_path(&sample.accession_code), sample)
    }

    fn list_result_files(&self) -> Result<Vec<ResultFile>, KiraError> {
        let dir = self.root.join("result_files");
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for path in walk_dir(dir.as_std_path())? {
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                files.push(read_json::<ResultFile>(&path)?);
            }
        }
        files.sort_by_key(|file| file.id);
        Ok(files)
    }
}

impl RecordStore for JsonRecordStore {
    fn job(&self, id: JobId) -> Result<Job, KiraError> {
        let path = self.job_path(id);
        if !path.as_std_path().exists() {
            return Err(KiraError::JobNotFound(id.get()));
        }
        read_json(path.as_std_path())
    }

    fn save_job(&self, job: &Job) -> Result<(), KiraError> {
        write_json_atomic(&self.job_path(job.id), job)
    }

    fn dataset(&self, id: &DatasetId) -> Result<DatasetSpec, KiraError> {
        let path = self.dataset_path(id)?;
        if !path.as_std_path().exists() {
            return Err(KiraError::DatasetNotFound(id.to_string()));
        }
        read_json(path.as_std_path())
    }

    fn save_dataset(&self, dataset: &DatasetSpec) -> Result<(), KiraError> {
        write_json_atomic(&self.dataset_path(&dataset.id)?, dataset)
    }

    fn sample(&self, accession: &Accession) -> Result<Sample, KiraError> {
        let path = self.sample_path(accession);
        if !path.as_std_path().exists() {
            return Err(KiraError::SampleNotFound(accession.to_string()));
        }
        read_json(path.as_std_path())
    }

    fn result_files(&self, sample: &Accession) -> Result<Vec<ResultFile>, KiraError> {
        Ok(self
            .list_result_files()?
            .into_iter()
            .filter(|file| file.samples.contains(sample))
            .collect())
    }

    fn add_result_file(&self, mut file: ResultFile) -> Result<ResultFile, KiraError> {
        let mut id = self
            .list_result_files()?
            .iter()
            .map(|existing| existing.id)
            .max()
            .unwrap_or(0)
            + 1;
        // Creating the record file claims the id. If another writer already
        // holds it, try the next one.
        loop {
            file.id = id;
            let path = self.result_file_path(id);
            let temp = write_json_temp(&path, &file)?;
            match temp.persist_noclobber(path.as_std_path()) {
                Ok(_) => return Ok(file),
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => id += 1,
                Err(err) => return Err(KiraError::Filesystem(err.error.to_string())),
            }
        }
    }

    fn normalization_target(&self, organism: &str) -> Result<Option<ResultFile>, KiraError> {
        let targets = self
            .list_result_files()?
            .into_iter()
            .filter(|file| file.organism.as_deref() == Some(organism))
            .collect::<Vec<_>>();
        Ok(most_recent_of_kind(&targets, ResultFileKind::QnTarget).cloned())
    }

    fn original_file(&self, id: u64) -> Result<OriginalFile, KiraError> {
        let path = self.original_file_path(id);
        if !path.as_std_path().exists() {
            return Err(KiraError::OriginalFileNotFound(id));
        }
        read_json(path.as_std_path())
    }

    fn save_original_file(&self, file: &OriginalFile) -> Result<(), KiraError> {
        write_json_atomic(&self.original_file_path(file.id), file)
    }

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, KiraError> {
        fs::read(path).map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, Job>,
    datasets: BTreeMap<DatasetId, DatasetSpec>,
    samples: BTreeMap<Accession, Sample>,
    result_files: Vec<ResultFile>,
    original_files: BTreeMap<u64, OriginalFile>,
    blobs: HashMap<String, Vec<u8>>,
}

/// Process-local record store. File contents registered with [`put_bytes`]
/// shadow the filesystem.
///
/// [`put_bytes`]: MemoryRecordStore::put_bytes
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: Job) {
        self.lock().jobs.insert(job.id, job);
    }

    pub fn insert_dataset(&self, dataset: DatasetSpec) {
        self.lock().datasets.insert(dataset.id.clone(), dataset);
    }

    pub fn insert_sample(&self, sample: Sample) {
        self.lock()
            .samples
            .insert(sample.accession_code.clone(), sample);
    }

    pub fn insert_original_file(&self, file: OriginalFile) {
        self.lock().original_files.insert(file.id, file);
    }

    pub fn put_bytes(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.lock().blobs.insert(path.into(), content.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    fn job(&self, id: JobId) -> Result<Job, KiraError> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(KiraError::JobNotFound(id.get()))
    }

    fn save_job(&self, job: &Job) -> Result<(), KiraError> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn dataset(&self, id: &DatasetId) -> Result<DatasetSpec, KiraError> {
        self.lock()
            .datasets
            .get(id)
            .cloned()
            .ok_or_else(|| KiraError::DatasetNotFound(id.to_string()))
    }

    fn save_dataset(&self, dataset: &DatasetSpec) -> Result<(), KiraError> {
        self.insert_dataset(dataset.clone());
        Ok(())
    }

    fn sample(&self, accession: &Accession) -> Result<Sample, KiraError> {
        self.lock()
            .samples
            .get(accession)
            .cloned()
            .ok_or_else(|| KiraError::SampleNotFound(accession.to_string()))
    }

    fn result_files(&self, sample: &Accession) -> Result<Vec<ResultFile>, KiraError> {
        Ok(self
            .lock()
            .result_files
            .iter()
            .filter(|file| file.samples.contains(sample))
            .cloned()
            .collect())
    }

    fn add_result_file(&self, mut file: ResultFile) -> Result<ResultFile, KiraError> {
        let mut state = self.lock();
        file.id = state.result_files.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        state.result_files.push(file.clone());
        Ok(file)
    }

    fn normalization_target(&self, organism: &str) -> Result<Option<ResultFile>, KiraError> {
        let state = self.lock();
        let targets = state
            .result_files
            .iter()
            .filter(|file| file.organism.as_deref() == Some(organism))
            .cloned()
            .collect::<Vec<_>>();
        Ok(most_recent_of_kind(&targets, ResultFileKind::QnTarget).cloned())
    }

    fn original_file(&self, id: u64) -> Result<OriginalFile, KiraError> {
        self.lock()
            .original_files
            .get(&id)
            .cloned()
            .ok_or(KiraError::OriginalFileNotFound(id))
    }

    fn save_original_file(&self, file: &OriginalFile) -> Result<(), KiraError> {
        self.insert_original_file(file.clone());
        Ok(())
    }

    fn read_bytes(&self, path: &str) -> Result<Vec<u8>, KiraError> {
        if let Some(content) = self.lock().blobs.get(path) {
            return Ok(content.clone());
        }
        fs::read(path).map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    write_json_temp(path, value)?
        .persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.error.to_string()))?;
    Ok(())
}

/// Serializes `value` into a uniquely named temp file next to `path`.
fn write_json_temp<T: Serialize>(path: &Utf8Path, value: &T) -> Result<NamedTempFile, KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid record path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-refinery-record")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    serde_json::to_writer_pretty(temp.as_file_mut(), value)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.as_file_mut()
        .flush()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(temp)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, KiraError> {
    let content = fs::read_to_string(path)
        .map_err(|err| KiraError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|err| KiraError::Filesystem(format!("parse {}: {err}", path.display())))
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobKind;

    #[test]
    fn layout_paths() {
        let store = JsonRecordStore::new(Utf8PathBuf::from("/data/records"));
        let acc: Accession = "GSM1234".parse().unwrap();

        assert!(store.job_path(JobId::new(7)).ends_with("jobs/7.json"));
        assert!(store.sample_path(&acc).ends_with("samples/GSM1234.json"));
        assert!(store.result_file_path(3).ends_with("result_files/3.json"));
        assert!(store.dataset_path(&DatasetId::new("../etc")).is_err());
    }

    #[test]
    fn job_roundtrip_on_disk() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("records")).unwrap();
        let store = JsonRecordStore::new(root);
        store.ensure_root().unwrap();

        let job = Job::new(JobId::new(11), JobKind::Download);
        store.save_job(&job).unwrap();
        assert_eq!(store.job(JobId::new(11)).unwrap(), job);
        assert!(matches!(
            store.job(JobId::new(12)),
            Err(KiraError::JobNotFound(12))
        ));
    }
}
