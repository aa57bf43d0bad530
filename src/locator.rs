use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::domain::{AggregateBy, ResultFileKind};
use crate::error::KiraError;
use crate::records::{DatasetSpec, RecordStore, ResultFile, Sample, most_recent_of_kind};

pub const ALL_KEY: &str = "ALL";

/// Result files chosen for one aggregation key, in sample order.
#[derive(Debug, Clone, Default)]
pub struct LocatedFiles {
    pub by_key: BTreeMap<String, Vec<(ResultFile, Sample)>>,
    pub found_any: bool,
}

impl LocatedFiles {
    pub fn num_files(&self) -> usize {
        self.by_key.values().map(Vec::len).sum()
    }
}

/// Groups the dataset's samples by its aggregation key. Samples keep the
/// order in which the dataset lists them and appear once per key.
pub fn aggregated_samples<S: RecordStore>(
    store: &S,
    dataset: &DatasetSpec,
) -> Result<BTreeMap<String, Vec<Sample>>, KiraError> {
    let mut grouped: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for (experiment, accessions) in &dataset.data {
        for accession in accessions {
            let sample = store.sample(accession)?;
            let key = match dataset.aggregate_by {
                AggregateBy::Experiment => experiment.to_string(),
                AggregateBy::Species => sample.organism.clone(),
                AggregateBy::All => ALL_KEY.to_string(),
            };
            let samples = grouped.entry(key).or_default();
            if !samples
                .iter()
                .any(|existing| existing.accession_code == sample.accession_code)
            {
                samples.push(sample);
            }
        }
    }
    Ok(grouped)
}

pub struct ResultFileLocator<'a, S: RecordStore> {
    store: &'a S,
    kind: ResultFileKind,
}

impl<'a, S: RecordStore> ResultFileLocator<'a, S> {
    pub fn new(store: &'a S, quant_sf_only: bool) -> Self {
        let kind = if quant_sf_only {
            ResultFileKind::QuantSf
        } else {
            ResultFileKind::Smashable
        };
        Self { store, kind }
    }

    pub fn locate(&self, samples: &BTreeMap<String, Vec<Sample>>) -> Result<LocatedFiles, KiraError> {
        let mut located = LocatedFiles::default();
        for (key, key_samples) in samples {
            let files = self.locate_key(key, key_samples)?;
            located.found_any |= !files.is_empty();
            located.by_key.insert(key.clone(), files);
        }
        Ok(located)
    }

    pub fn locate_key(&self, key: &str, samples: &[Sample]) -> Result<Vec<(ResultFile, Sample)>, KiraError> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for sample in samples {
            let files = self.store.result_files(&sample.accession_code)?;
            let Some(file) = most_recent_of_kind(&files, self.kind) else {
                debug!(key, sample = %sample.accession_code, "no usable result file");
                continue;
            };
            if !seen.insert(file.id) {
                debug!(key, sample = %sample.accession_code, file_id = file.id, "result file already selected");
                continue;
            }
            selected.push((file.clone(), sample.clone()));
        }
        Ok(selected)
    }
}
