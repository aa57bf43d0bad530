use tracing::{info, warn};

use crate::frame::{Frame, MergedTable};

/// Result of merging the frames of one aggregation key.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub table: Option<MergedTable>,
    /// Lead columns of frames whose join would have left no rows.
    pub unsmashable: Vec<String>,
    /// Lead columns of frames skipped because a column was already present.
    pub duplicates: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct MergeEngine;

impl MergeEngine {
    /// Inner-joins `frames` in order. The first frame is the accumulator; a
    /// frame whose columns collide with it is skipped, and a frame whose join
    /// empties it is rolled back and reported as unsmashable.
    pub fn merge(key: &str, frames: Vec<Frame>) -> MergeReport {
        let mut report = MergeReport::default();
        let mut frames = frames.into_iter();
        let Some(mut merged) = frames.next() else {
            return report;
        };

        for (position, frame) in frames.enumerate() {
            let frame_number = position + 2;
            if frame_number % 1000 == 0 {
                info!(key, frame_number, "smashing keyframe");
            }

            if let Some(column) = frame
                .columns()
                .iter()
                .find(|column| merged.columns().contains(column))
            {
                warn!(key, column = %column, "column repeated for smash job");
                report
                    .warnings
                    .push(format!("Column repeated for smash job: {column}"));
                report.duplicates.push(lead_column(&frame));
                continue;
            }

            let old_len = merged.num_rows();
            let joined = merged.inner_join(&frame);
            let new_len = joined.num_rows();

            if new_len == 0 {
                let lead = lead_column(&frame);
                warn!(key, old_len, bad_frame_number = frame_number, frame = %lead, "skipping a bad merge frame");
                report
                    .warnings
                    .push(format!("Skipped frame {lead}: no features in common with {key}"));
                report.unsmashable.push(lead);
                continue;
            }

            if new_len < old_len {
                warn!(key, old_len, new_len, "dropped rows while smashing");
                report.warnings.push(format!(
                    "Dropped rows while smashing {key}: {old_len} -> {new_len}"
                ));
            }
            merged = joined;
        }

        report.table = Some(merged);
        report
    }
}

fn lead_column(frame: &Frame) -> String {
    frame
        .columns()
        .first()
        .cloned()
        .unwrap_or_else(|| "<unnamed>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(column: &str, features: &[&str]) -> Frame {
        Frame::single(
            column,
            features.iter().map(|f| f.to_string()).collect(),
            (0..features.len()).map(|v| v as f64).collect(),
        )
        .unwrap()
    }

    #[test]
    fn empty_input_has_no_table() {
        let report = MergeEngine::merge("k", Vec::new());
        assert!(report.table.is_none());
    }

    #[test]
    fn duplicate_columns_are_skipped() {
        let report = MergeEngine::merge("k", vec![frame("s1", &["g1"]), frame("s1", &["g1"])]);
        let table = report.table.unwrap();
        assert_eq!(table.columns(), ["s1"]);
        assert_eq!(report.duplicates, vec!["s1"]);
        assert!(report.unsmashable.is_empty());
    }
}
