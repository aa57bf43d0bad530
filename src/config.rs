use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-refinery.json";

/// Capacity of the persisted `failure_reason` field.
pub const DEFAULT_FAILURE_REASON_MAX_LEN: usize = 256;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_store_root: Option<String>,
    #[serde(default)]
    pub records_root: Option<String>,
    #[serde(default)]
    pub results_root: Option<String>,
    #[serde(default)]
    pub upload: Option<bool>,
    #[serde(default)]
    pub skip_processed: Option<bool>,
    #[serde(default)]
    pub failure_reason_max_len: Option<usize>,
    #[serde(default)]
    pub dataset_expiry_days: Option<i64>,
    #[serde(default)]
    pub readme_path: Option<String>,
    #[serde(default)]
    pub license_path: Option<String>,
    #[serde(default)]
    pub validation: Option<ValidationEntry>,
    #[serde(default)]
    pub quant_tool: Option<QuantToolEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ValidationEntry {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_pairs: Option<usize>,
    #[serde(default)]
    pub ks_statistic_threshold: Option<f64>,
    #[serde(default)]
    pub ks_pvalue_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct QuantToolEntry {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub index: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSettings {
    pub enabled: bool,
    pub seed: u64,
    pub max_pairs: usize,
    pub ks_statistic_threshold: f64,
    pub ks_pvalue_threshold: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: 123,
            max_pairs: 100,
            ks_statistic_threshold: 0.001,
            ks_pvalue_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantToolSettings {
    pub program: String,
    /// Argument template. `{index}`, `{input}` and `{output_dir}` are substituted.
    pub args: Vec<String>,
    pub index: Option<String>,
}

impl Default for QuantToolSettings {
    fn default() -> Self {
        Self {
            program: "salmon".to_string(),
            args: default_quant_args(),
            index: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_store_root: Utf8PathBuf,
    pub records_root: Utf8PathBuf,
    pub results_root: Utf8PathBuf,
    pub upload: bool,
    pub skip_processed: bool,
    pub failure_reason_max_len: usize,
    pub dataset_expiry_days: i64,
    pub readme_path: Option<Utf8PathBuf>,
    pub license_path: Option<Utf8PathBuf>,
    pub validation: ValidationSettings,
    pub quant_tool: QuantToolSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at an explicit data store directory.
    pub fn with_root(data_store_root: Utf8PathBuf) -> Self {
        Self {
            schema_version: 1,
            records_root: data_store_root.join("records"),
            results_root: data_store_root.join("results"),
            data_store_root,
            upload: true,
            skip_processed: true,
            failure_reason_max_len: DEFAULT_FAILURE_REASON_MAX_LEN,
            dataset_expiry_days: 7,
            readme_path: None,
            license_path: None,
            validation: ValidationSettings::default(),
            quant_tool: QuantToolSettings::default(),
        }
    }

    pub fn smashed_root(&self) -> Utf8PathBuf {
        self.data_store_root.join("smashed")
    }

    pub fn originals_root(&self) -> Utf8PathBuf {
        self.data_store_root.join("originals")
    }

    pub fn processed_root(&self) -> Utf8PathBuf {
        self.data_store_root.join("processed")
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let data_store_root = match config.data_store_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_data_store_root()?,
        };
        let mut resolved = ResolvedConfig::with_root(data_store_root);
        resolved.schema_version = config.schema_version.unwrap_or(1);

        if let Some(root) = config.records_root {
            resolved.records_root = Utf8PathBuf::from(root);
        }
        if let Some(root) = config.results_root {
            resolved.results_root = Utf8PathBuf::from(root);
        }
        if let Some(upload) = config.upload {
            resolved.upload = upload;
        }
        if let Some(skip) = config.skip_processed {
            resolved.skip_processed = skip;
        }
        if let Some(max_len) = config.failure_reason_max_len {
            if max_len == 0 {
                return Err(KiraError::ConfigParse(
                    "failure_reason_max_len must be positive".to_string(),
                ));
            }
            resolved.failure_reason_max_len = max_len;
        }
        if let Some(days) = config.dataset_expiry_days {
            resolved.dataset_expiry_days = days;
        }
        resolved.readme_path = config.readme_path.map(Utf8PathBuf::from);
        resolved.license_path = config.license_path.map(Utf8PathBuf::from);

        if let Some(entry) = config.validation {
            let defaults = ValidationSettings::default();
            resolved.validation = ValidationSettings {
                enabled: entry.enabled.unwrap_or(defaults.enabled),
                seed: entry.seed.unwrap_or(defaults.seed),
                max_pairs: entry.max_pairs.unwrap_or(defaults.max_pairs),
                ks_statistic_threshold: entry
                    .ks_statistic_threshold
                    .unwrap_or(defaults.ks_statistic_threshold),
                ks_pvalue_threshold: entry
                    .ks_pvalue_threshold
                    .unwrap_or(defaults.ks_pvalue_threshold),
            };
        }

        if let Some(entry) = config.quant_tool {
            let defaults = QuantToolSettings::default();
            resolved.quant_tool = QuantToolSettings {
                program: entry.program.unwrap_or(defaults.program),
                args: entry.args.unwrap_or(defaults.args),
                index: entry.index,
            };
        }

        Ok(resolved)
    }
}

pub fn default_quant_args() -> Vec<String> {
    [
        "--no-version-check",
        "quant",
        "-l",
        "A",
        "-i",
        "{index}",
        "-r",
        "{input}",
        "-o",
        "{output_dir}",
        "--seqBias",
        "--dumpEq",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn default_data_store_root() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("kira-refinery")).ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve data store directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_explicit_root() {
        let config = Config {
            data_store_root: Some("/srv/refinery".to_string()),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.records_root, Utf8PathBuf::from("/srv/refinery/records"));
        assert_eq!(resolved.smashed_root(), Utf8PathBuf::from("/srv/refinery/smashed"));
        assert_eq!(resolved.failure_reason_max_len, 256);
        assert_eq!(resolved.validation, ValidationSettings::default());
        assert_eq!(resolved.quant_tool.args, default_quant_args());
    }
}
