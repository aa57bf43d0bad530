use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::domain::DatasetId;
use crate::error::KiraError;
use crate::frame::MergedTable;
use crate::fs_util;
use crate::metadata::{AggregatedMetadata, write_json};

pub const README_FILE: &str = "README.md";
pub const LICENSE_FILE: &str = "LICENSE.TXT";
pub const AGGREGATED_METADATA_FILE: &str = "aggregated_metadata.json";
pub const INDEX_LABEL: &str = "Gene";

const BUNDLED_README: &str = include_str!("../assets/README_DATASET.md");
const BUNDLED_LICENSE: &str = include_str!("../assets/LICENSE_DATASET.txt");

#[derive(Debug, Clone, PartialEq)]
pub struct PackagedArchive {
    pub path: Utf8PathBuf,
    pub size_in_bytes: u64,
    pub sha256: String,
}

/// Lays out one dataset's output directory and zips it.
pub struct OutputPackager<'a> {
    config: &'a ResolvedConfig,
    output_dir: Utf8PathBuf,
}

impl<'a> OutputPackager<'a> {
    pub fn new(config: &'a ResolvedConfig, output_dir: Utf8PathBuf) -> Self {
        Self { config, output_dir }
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// Path of `path` inside the archive.
    pub fn relative(&self, path: &Utf8Path) -> String {
        path.strip_prefix(&self.output_dir)
            .map(|relative| relative.as_str().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string())
    }

    pub fn write_table(&self, key: &str, table: &MergedTable) -> Result<Utf8PathBuf, KiraError> {
        let path = self.output_dir.join(key).join(format!("{key}.tsv"));
        let content = table.to_tsv(INDEX_LABEL)?;
        write_file(&path, &content)?;
        debug!(key, path = %path, rows = table.num_rows(), columns = table.num_columns(), "wrote merged table");
        Ok(path)
    }

    pub fn copy_quant_file(
        &self,
        key: &str,
        accession: &str,
        content: &[u8],
    ) -> Result<Utf8PathBuf, KiraError> {
        let path = self
            .output_dir
            .join(key)
            .join(format!("{accession}_quant.sf"));
        write_file(&path, content)?;
        Ok(path)
    }

    /// README and license, from the configured paths or the bundled texts.
    pub fn write_documents(&self) -> Result<Vec<Utf8PathBuf>, KiraError> {
        let readme = self.output_dir.join(README_FILE);
        let license = self.output_dir.join(LICENSE_FILE);
        place_document(self.config.readme_path.as_deref(), BUNDLED_README, &readme)?;
        place_document(self.config.license_path.as_deref(), BUNDLED_LICENSE, &license)?;
        Ok(vec![readme, license])
    }

    pub fn write_aggregated_metadata(
        &self,
        metadata: &AggregatedMetadata,
    ) -> Result<Utf8PathBuf, KiraError> {
        let path = self.output_dir.join(AGGREGATED_METADATA_FILE);
        // Going through Value sorts the keys.
        let value =
            serde_json::to_value(metadata).map_err(|err| KiraError::Metadata(err.to_string()))?;
        write_json(&path, &value)?;
        Ok(path)
    }

    /// Zips the output directory into `<smashed_root>/<dataset_id>.zip`.
    pub fn archive(&self, dataset_id: &DatasetId) -> Result<PackagedArchive, KiraError> {
        let path = self
            .config
            .smashed_root()
            .join(format!("{}.zip", dataset_id.as_str()));
        fs_util::archive_dir(&self.output_dir, &path)?;
        fs_util::validate_zip(&path)?;
        let (sha256, size_in_bytes) = fs_util::sha256_file(&path)?;
        info!(dataset_id = %dataset_id, path = %path, size_in_bytes, "dataset archived");
        Ok(PackagedArchive {
            path,
            size_in_bytes,
            sha256,
        })
    }
}

fn place_document(
    configured: Option<&Utf8Path>,
    bundled: &str,
    destination: &Utf8Path,
) -> Result<(), KiraError> {
    match configured {
        Some(source) => fs_util::copy_file_atomic(source, destination).map(|_| ()),
        None => write_file(destination, bundled.as_bytes()),
    }
}

fn write_file(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| KiraError::Filesystem(format!("{parent}: {err}")))?;
    }
    fs::write(path, content).map_err(|err| KiraError::Filesystem(format!("{path}: {err}")))
}
