use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::KiraError;
use crate::fs_util;
use crate::pipeline::JobOutcome;

/// Receives the outcome of every finished job.
pub trait Notifier {
    fn notify(&self, outcome: &JobOutcome);
}

/// Prints outcomes as pretty JSON on stdout.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl Notifier for JsonOutput {
    fn notify(&self, outcome: &JobOutcome) {
        if let Err(err) = Self::print_json(outcome) {
            warn!(job_id = %outcome.job_id, error = %err, "failed to print job outcome");
        }
    }
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, outcome: &JobOutcome) {
        if outcome.success {
            info!(
                job_id = %outcome.job_id,
                kind = %outcome.kind,
                location = outcome.output_location.as_deref().unwrap_or_default(),
                "job finished"
            );
        } else {
            warn!(
                job_id = %outcome.job_id,
                kind = %outcome.kind,
                reason = outcome.failure_reason.as_deref().unwrap_or_default(),
                "job failed"
            );
        }
    }
}

/// Publishes a finished archive and returns where it can be fetched from.
pub trait ArtifactUploader {
    fn upload(&self, archive: &Utf8Path) -> Result<String, KiraError>;
}

/// Copies archives into a results directory.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    root: Utf8PathBuf,
}

impl LocalUploader {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }
}

impl ArtifactUploader for LocalUploader {
    fn upload(&self, archive: &Utf8Path) -> Result<String, KiraError> {
        let file_name = archive
            .file_name()
            .ok_or_else(|| KiraError::Filesystem(format!("{archive} has no file name")))?;
        let destination = self.root.join(file_name);
        let copied = fs_util::copy_file_atomic(archive, &destination)?;
        info!(source = %archive, destination = %destination, size_in_bytes = copied, "archive uploaded");
        Ok(destination.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_upload_copies_into_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let archive = root.join("smashed/7.zip");
        std::fs::create_dir_all(archive.parent().unwrap()).unwrap();
        std::fs::write(&archive, b"zip").unwrap();

        let uploader = LocalUploader::new(root.join("results"));
        let location = uploader.upload(&archive).unwrap();
        assert_eq!(location, root.join("results/7.zip").to_string());
        assert_eq!(std::fs::read(root.join("results/7.zip")).unwrap(), b"zip");
    }
}
