use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::ValidationSettings;
use crate::error::KiraError;
use crate::frame::Frame;
use crate::stats::{average_ranks, finite_sorted, ks_two_sample, median, quantile_sorted};

/// Organism-specific target distribution for quantile normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDistribution {
    sorted: Vec<f64>,
}

impl ReferenceDistribution {
    pub fn from_values(values: Vec<f64>) -> Option<Self> {
        let sorted = finite_sorted(&values);
        (!sorted.is_empty()).then_some(Self { sorted })
    }

    /// Parses a headerless single-column file. Lines whose first field is not
    /// numeric are skipped.
    pub fn parse(path: &str, bytes: &[u8]) -> Result<Self, KiraError> {
        let text = std::str::from_utf8(bytes).map_err(|err| KiraError::InvalidReference {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let values = text
            .lines()
            .filter_map(|line| line.split('\t').next())
            .filter_map(|field| field.trim().parse::<f64>().ok())
            .collect();
        Self::from_values(values).ok_or_else(|| KiraError::InvalidReference {
            path: path.to_string(),
            message: "no numeric values".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    fn at_quantile(&self, q: f64) -> f64 {
        quantile_sorted(&self.sorted, q).unwrap_or(f64::NAN)
    }
}

/// Conforms every column to the reference distribution. Each value is
/// replaced by the reference evaluated at the value's rank quantile, ties
/// sharing their average rank; NaNs stay where they are.
pub fn quantile_normalize(table: &Frame, reference: &ReferenceDistribution) -> Frame {
    table.map_columns(|column| {
        let ranks = average_ranks(column);
        let count = ranks.iter().filter(|rank| !rank.is_nan()).count();
        ranks
            .iter()
            .map(|&rank| {
                if rank.is_nan() {
                    f64::NAN
                } else if count == 1 {
                    reference.at_quantile(0.5)
                } else {
                    reference.at_quantile((rank - 1.0) / (count - 1) as f64)
                }
            })
            .collect()
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub pairs_tested: usize,
    pub ks_statistic: Option<f64>,
    pub ks_pvalue: Option<f64>,
    pub warning: Option<String>,
}

/// Checks that normalized columns share one distribution by running KS tests
/// on shuffled column pairs, restricted to each column's above-median values.
pub fn validate(table: &Frame, settings: &ValidationSettings) -> ValidationReport {
    let mut report = ValidationReport::default();
    let columns = table.num_columns();
    if columns < 2 {
        warn!(
            columns,
            "not enough columns to perform KS test, either bad smash or single sample smash"
        );
        return report;
    }

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut pairs: Vec<(usize, usize)> = (0..columns)
        .flat_map(|a| (a + 1..columns).map(move |b| (a, b)))
        .collect();
    pairs.shuffle(&mut rng);

    for &(a, b) in pairs.iter().take(settings.max_pairs) {
        let test_a = above_median(table.column(a));
        let test_b = above_median(table.column(b));
        let Some(result) = ks_two_sample(&test_a, &test_b) else {
            debug!(a = %table.columns()[a], b = %table.columns()[b], "no values above median, skipping pair");
            continue;
        };
        report.pairs_tested += 1;
        report.ks_statistic = Some(result.statistic);
        report.ks_pvalue = Some(result.pvalue);

        if result.statistic > settings.ks_statistic_threshold
            || result.pvalue < settings.ks_pvalue_threshold
        {
            report.warning = Some(format!(
                "Failed Kolmogorov Smirnov test! Stat: {}, PVal: {}",
                result.statistic, result.pvalue
            ));
        }
    }
    report
}

fn above_median(values: &[f64]) -> Vec<f64> {
    let Some(median) = median(values) else {
        return Vec::new();
    };
    values.iter().copied().filter(|v| *v > median).collect()
}
