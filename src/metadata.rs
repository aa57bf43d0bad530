//! Per-sample and per-experiment metadata shipped with a smashed dataset.
//!
//! Every sample is flattened into a map of `refinery_*` fields plus its raw
//! annotations. The TSV schema puts the accession code and experiment
//! accession first, then the remaining flat fields, then the annotation
//! columns, both alphabetical. Annotations are unnested per source database:
//!
//! - ArrayExpress: `characteristic` (`category`/`value`) and `variable`
//!   (`name`/`value`) entries become columns, `source` is dropped.
//! - GEO: `characteristics_ch1` strings are split at the first `:`.
//! - Otherwise `{"name": v}` yields `v`, a one-element list yields its element,
//!   anything else is kept as is.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::domain::{AggregateBy, ScaleBy, SourceDatabase};
use crate::error::KiraError;
use crate::records::{DatasetSpec, Sample};

pub const RESERVED_PREFIX: &str = "refinery_";
pub const ACCESSION_COLUMN: &str = "refinery_accession_code";
pub const EXPERIMENT_COLUMN: &str = "experiment_accession";
pub const ANNOTATIONS_FIELD: &str = "refinery_annotations";
const SOURCE_FIELD: &str = "refinery_source_database";

pub type SampleMetadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentMetadata {
    pub accession_code: String,
    pub organisms: Vec<String>,
    pub sample_accession_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledMetadata {
    pub samples: BTreeMap<String, SampleMetadata>,
    pub experiments: BTreeMap<String, ExperimentMetadata>,
}

/// Contents of `aggregated_metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetadata {
    pub num_samples: usize,
    pub num_experiments: usize,
    pub created_at: DateTime<Utc>,
    pub aggregate_by: AggregateBy,
    pub scale_by: ScaleBy,
    pub quantile_normalized: bool,
    pub quant_sf_only: bool,
    pub ks_statistic: Option<f64>,
    pub ks_pvalue: Option<f64>,
    pub ks_warning: Option<String>,
    pub unsmashable_files: Vec<String>,
    pub warnings: Vec<String>,
    pub samples: BTreeMap<String, SampleMetadata>,
    pub experiments: BTreeMap<String, ExperimentMetadata>,
    /// Archive-relative paths of the data and metadata files.
    pub files: Vec<String>,
}

pub struct MetadataCompiler;

impl MetadataCompiler {
    pub fn compile(dataset: &DatasetSpec, samples: &[Sample]) -> CompiledMetadata {
        let mut compiled = CompiledMetadata::default();
        for sample in samples {
            compiled
                .samples
                .insert(sample.accession_code.to_string(), sample_metadata(sample));
        }

        for (experiment, accessions) in &dataset.data {
            let mut organisms = BTreeSet::new();
            let mut codes = Vec::new();
            for accession in accessions {
                if let Some(sample) = samples.iter().find(|s| &s.accession_code == accession) {
                    organisms.insert(sample.organism.clone());
                }
                codes.push(accession.to_string());
            }
            compiled.experiments.insert(
                experiment.to_string(),
                ExperimentMetadata {
                    accession_code: experiment.to_string(),
                    organisms: organisms.into_iter().collect(),
                    sample_accession_codes: codes,
                },
            );
        }
        compiled
    }

    /// Uniform header shared by every metadata TSV of the dataset.
    pub fn tsv_columns(samples: &BTreeMap<String, SampleMetadata>) -> Vec<String> {
        let mut flat_columns = BTreeSet::new();
        let mut annotation_columns = BTreeSet::new();
        for metadata in samples.values() {
            let source = source_of(metadata);
            for (key, value) in metadata {
                if key != ANNOTATIONS_FIELD {
                    flat_columns.insert(key.clone());
                    continue;
                }
                for annotation in value.as_array().into_iter().flatten() {
                    let Some(annotation) = annotation.as_object() else {
                        continue;
                    };
                    for (column, _) in unnest_annotation(source.as_ref(), annotation) {
                        if !column.starts_with(RESERVED_PREFIX) {
                            annotation_columns.insert(column);
                        }
                    }
                }
            }
        }

        flat_columns.remove(ACCESSION_COLUMN);
        flat_columns.remove(EXPERIMENT_COLUMN);
        annotation_columns.remove(EXPERIMENT_COLUMN);
        let mut columns = vec![ACCESSION_COLUMN.to_string(), EXPERIMENT_COLUMN.to_string()];
        columns.extend(flat_columns);
        columns.extend(annotation_columns);
        columns
    }

    /// One TSV row keyed by column name.
    pub fn tsv_row(metadata: &SampleMetadata, dataset: &DatasetSpec) -> SampleMetadata {
        let accession = metadata
            .get(ACCESSION_COLUMN)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let source = source_of(metadata);
        let mut row = Map::new();
        for (key, value) in metadata {
            if key != ANNOTATIONS_FIELD {
                row.insert(key.clone(), value.clone());
                continue;
            }
            for annotation in value.as_array().into_iter().flatten() {
                let Some(annotation) = annotation.as_object() else {
                    continue;
                };
                for (column, value) in unnest_annotation(source.as_ref(), annotation) {
                    add_annotation_value(&mut row, column, value, &accession);
                }
            }
        }

        let experiment = dataset
            .data
            .iter()
            .find(|(_, samples)| samples.iter().any(|s| s.as_str() == accession))
            .map(|(experiment, _)| experiment.to_string())
            .unwrap_or_default();
        row.insert(EXPERIMENT_COLUMN.to_string(), Value::String(experiment));
        row
    }

    /// Writes the metadata tables matching the dataset's aggregation and
    /// returns the TSV paths. `keys` are the aggregation keys of the job.
    pub fn write_tables(
        output_dir: &Utf8Path,
        dataset: &DatasetSpec,
        metadata: &CompiledMetadata,
        keys: &[String],
    ) -> Result<Vec<Utf8PathBuf>, KiraError> {
        let columns = Self::tsv_columns(&metadata.samples);
        let mut paths = Vec::new();
        match dataset.aggregate_by {
            AggregateBy::Experiment => {
                for (experiment, data) in &metadata.experiments {
                    let rows = metadata
                        .samples
                        .iter()
                        .filter(|(code, _)| data.sample_accession_codes.contains(code))
                        .map(|(_, sample)| Self::tsv_row(sample, dataset));
                    let path = output_dir
                        .join(experiment)
                        .join(format!("metadata_{experiment}.tsv"));
                    write_tsv(&path, &columns, rows)?;
                    paths.push(path);
                }
            }
            AggregateBy::Species => {
                for species in keys {
                    let in_species: Vec<&SampleMetadata> = metadata
                        .samples
                        .values()
                        .filter(|sample| {
                            sample.get("refinery_organism").and_then(Value::as_str)
                                == Some(species.as_str())
                        })
                        .collect();
                    let dir = output_dir.join(species);
                    let path = dir.join(format!("metadata_{species}.tsv"));
                    write_tsv(
                        &path,
                        &columns,
                        in_species.iter().map(|sample| Self::tsv_row(sample, dataset)),
                    )?;
                    paths.push(path);

                    if !in_species.is_empty() {
                        let document = json!({ "species": species, "samples": in_species });
                        write_json(&dir.join(format!("metadata_{species}.json")), &document)?;
                    }
                }
            }
            AggregateBy::All => {
                let rows = metadata
                    .samples
                    .values()
                    .map(|sample| Self::tsv_row(sample, dataset));
                let path = output_dir.join("ALL").join("metadata_ALL.tsv");
                write_tsv(&path, &columns, rows)?;
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

pub fn sample_metadata(sample: &Sample) -> SampleMetadata {
    let mut metadata = Map::new();
    metadata.insert(
        ACCESSION_COLUMN.to_string(),
        Value::String(sample.accession_code.to_string()),
    );
    metadata.insert(
        "refinery_organism".to_string(),
        Value::String(sample.organism.clone()),
    );
    metadata.insert(
        SOURCE_FIELD.to_string(),
        Value::String(sample.source_database.to_string()),
    );
    metadata.insert(
        "refinery_title".to_string(),
        sample.title.clone().map(Value::String).unwrap_or(Value::Null),
    );
    for (key, value) in &sample.fields {
        let key = if key.starts_with(RESERVED_PREFIX) {
            key.clone()
        } else {
            format!("{RESERVED_PREFIX}{key}")
        };
        metadata.entry(key).or_insert_with(|| value.clone());
    }
    metadata.insert(
        ANNOTATIONS_FIELD.to_string(),
        Value::Array(
            sample
                .annotations
                .iter()
                .cloned()
                .map(Value::Object)
                .collect(),
        ),
    );
    metadata
}

fn source_of(metadata: &SampleMetadata) -> Option<SourceDatabase> {
    metadata
        .get(SOURCE_FIELD)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn unnest_annotation(source: Option<&SourceDatabase>, annotation: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut pairs = Vec::new();
    for (key, value) in annotation {
        match (source, key.as_str()) {
            (Some(SourceDatabase::ArrayExpress), "characteristic") => {
                pairs.extend(nested_pairs(value, "category"));
            }
            (Some(SourceDatabase::ArrayExpress), "variable") => {
                pairs.extend(nested_pairs(value, "name"));
            }
            (Some(SourceDatabase::ArrayExpress), "source") => {}
            (Some(SourceDatabase::Geo), "characteristics_ch1") => {
                for entry in value.as_array().into_iter().flatten() {
                    let Some((name, text)) = entry.as_str().and_then(|s| s.split_once(':')) else {
                        continue;
                    };
                    pairs.push((name.trim().to_string(), Value::String(text.trim().to_string())));
                }
            }
            _ => pairs.push((key.clone(), simplify(value))),
        }
    }
    pairs
}

fn nested_pairs(value: &Value, name_field: &str) -> Vec<(String, Value)> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|pair| {
            let name = pair.get(name_field)?.as_str()?;
            let value = pair.get("value")?;
            Some((name.to_string(), value.clone()))
        })
        .collect()
}

fn simplify(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key("name") => map["name"].clone(),
        Value::Array(items) if items.len() == 1 => items[0].clone(),
        other => other.clone(),
    }
}

fn add_annotation_value(row: &mut SampleMetadata, column: String, value: Value, accession: &str) {
    if column.starts_with(RESERVED_PREFIX) {
        warn!(annotation_field = %column, sample_accession_code = accession, "annotation value skipped");
        return;
    }
    match row.get(&column) {
        None => {
            row.insert(column, value);
        }
        Some(existing) if *existing != value => {
            warn!(
                sample_accession_code = accession,
                column = %column,
                kept = %existing,
                dropped = %value,
                "conflict of values found in annotation column"
            );
        }
        Some(_) => {}
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_tsv(
    path: &Utf8Path,
    columns: &[String],
    rows: impl Iterator<Item = SampleMetadata>,
) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Metadata(format!("{parent}: {err}")))?;
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path.as_std_path())
        .map_err(|err| KiraError::Metadata(format!("{path}: {err}")))?;
    writer
        .write_record(columns)
        .map_err(|err| KiraError::Metadata(err.to_string()))?;
    for row in rows {
        let record: Vec<String> = columns.iter().map(|column| cell(row.get(column))).collect();
        writer
            .write_record(&record)
            .map_err(|err| KiraError::Metadata(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| KiraError::Metadata(err.to_string()))
}

pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Metadata(format!("{parent}: {err}")))?;
    }
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| KiraError::Metadata(err.to_string()))?;
    fs::write(path.as_std_path(), content).map_err(|err| KiraError::Metadata(format!("{path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_unwraps_single_values() {
        assert_eq!(simplify(&json!({"name": "liver"})), json!("liver"));
        assert_eq!(simplify(&json!(["x"])), json!("x"));
        assert_eq!(simplify(&json!(["x", "y"])), json!(["x", "y"]));
    }

    #[test]
    fn geo_characteristics_split_on_first_colon() {
        let annotation = json!({"characteristics_ch1": ["time: 10:30", "no colon"]});
        let pairs = unnest_annotation(Some(&SourceDatabase::Geo), annotation.as_object().unwrap());
        assert_eq!(pairs, vec![("time".to_string(), json!("10:30"))]);
    }

    #[test]
    fn conflicting_values_keep_first() {
        let mut row = Map::new();
        add_annotation_value(&mut row, "tissue".into(), json!("liver"), "GSM1");
        add_annotation_value(&mut row, "tissue".into(), json!("brain"), "GSM1");
        add_annotation_value(&mut row, "refinery_x".into(), json!("y"), "GSM1");
        assert_eq!(row.get("tissue"), Some(&json!("liver")));
        assert!(!row.contains_key("refinery_x"));
    }
}
