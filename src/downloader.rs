use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::domain::JobKind;
use crate::error::KiraError;
use crate::fs_util;
use crate::pipeline::{ContextCore, JobContext, Pipeline, Stage};
use crate::records::{Job, OriginalFile, RecordStore};

pub const NO_ORIGINAL_FILES_REASON: &str = "No files were found for this download job";

pub trait FileFetcher: Send + Sync {
    /// Streams `url` into `destination`, which the caller has already created.
    fn fetch(&self, url: &str, destination: &mut dyn io::Write) -> Result<u64, KiraError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-refinery/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::DownloadHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60 * 30))
            .build()
            .map_err(|err| KiraError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn normalize_url(url: &str) -> String {
        match url.strip_prefix("ftp://") {
            Some(rest) if rest.starts_with("ftp.ncbi.nlm.nih.gov/") || rest.starts_with("ftp.ebi.ac.uk/") => {
                format!("https://{rest}")
            }
            _ => url.to_string(),
        }
    }
}

impl FileFetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &mut dyn io::Write) -> Result<u64, KiraError> {
        let url = Self::normalize_url(url);
        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| KiraError::DownloadHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| format!("request to {url} failed"));
            return Err(KiraError::DownloadStatus { status, message });
        }
        io::copy(&mut response, destination).map_err(|err| KiraError::DownloadHttp(err.to_string()))
    }
}

pub struct DownloadContext {
    core: ContextCore,
    pub files: Vec<OriginalFile>,
    pub downloaded: usize,
    pub skipped: usize,
}

impl JobContext for DownloadContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

pub struct DownloadPipeline<'a, S: RecordStore, F: FileFetcher + ?Sized> {
    store: &'a S,
    config: &'a ResolvedConfig,
    fetcher: &'a F,
}

impl<'a, S: RecordStore, F: FileFetcher + ?Sized> DownloadPipeline<'a, S, F> {
    pub fn new(store: &'a S, config: &'a ResolvedConfig, fetcher: &'a F) -> Self {
        Self {
            store,
            config,
            fetcher,
        }
    }

    fn load_files(&self, context: &mut DownloadContext) -> Result<(), KiraError> {
        for id in context.core.job.original_files.clone() {
            context.files.push(self.store.original_file(id)?);
        }
        if context.files.is_empty() {
            context.core.fail(NO_ORIGINAL_FILES_REASON);
        }
        Ok(())
    }

    fn download_files(&self, context: &mut DownloadContext) -> Result<(), KiraError> {
        for file in &mut context.files {
            let destination = self.destination(file);
            if self.config.skip_processed && already_downloaded(file, &destination) {
                debug!(file_id = file.id, path = %destination, "already downloaded");
                context.skipped += 1;
                continue;
            }

            self.fetch_into(file, &destination)?;
            let (sha256, size) = fs_util::sha256_file(&destination)?;
            file.local_path = Some(destination.to_string());
            file.size_in_bytes = Some(size);
            file.sha256 = Some(sha256);
            file.is_downloaded = true;
            self.store.save_original_file(file)?;
            context.downloaded += 1;
            info!(file_id = file.id, url = %file.source_url, size_in_bytes = size, "downloaded original file");
        }
        Ok(())
    }

    fn destination(&self, file: &OriginalFile) -> Utf8PathBuf {
        match &file.local_path {
            Some(path) => Utf8PathBuf::from(path),
            None => {
                let owner = file
                    .sample
                    .as_ref()
                    .map(|sample| sample.to_string())
                    .unwrap_or_else(|| file.id.to_string());
                self.config.originals_root().join(owner).join(&file.filename)
            }
        }
    }

    fn fetch_into(&self, file: &OriginalFile, destination: &Utf8Path) -> Result<(), KiraError> {
        let parent = destination
            .parent()
            .ok_or_else(|| KiraError::Filesystem(format!("{destination} has no parent")))?;
        fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(format!("{parent}: {err}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        self.fetcher.fetch(&file.source_url, &mut temp)?;
        temp.persist(destination)
            .map_err(|err| KiraError::Filesystem(format!("{destination}: {}", err.error)))?;
        Ok(())
    }
}

fn already_downloaded(file: &OriginalFile, destination: &Utf8Path) -> bool {
    if !file.is_downloaded {
        return false;
    }
    match (fs::metadata(destination), file.size_in_bytes) {
        (Ok(metadata), Some(size)) => metadata.len() == size,
        _ => false,
    }
}

impl<'a, S: RecordStore, F: FileFetcher + ?Sized> Pipeline for DownloadPipeline<'a, S, F> {
    type Context = DownloadContext;

    fn kind(&self) -> JobKind {
        JobKind::Download
    }

    fn prepare(&self, job: Job) -> Result<DownloadContext, KiraError> {
        Ok(DownloadContext {
            core: ContextCore::new(job),
            files: Vec::new(),
            downloaded: 0,
            skipped: 0,
        })
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![
            Stage::new("load_files", Self::load_files),
            Stage::new("download_files", Self::download_files),
        ]
    }

    fn end_job(&self, context: &mut DownloadContext) -> Result<(), KiraError> {
        debug!(
            job_id = %context.core.job_id(),
            downloaded = context.downloaded,
            skipped = context.skipped,
            "ending download job"
        );
        Ok(())
    }
}
