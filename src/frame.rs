use std::collections::{HashMap, HashSet};
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::warn;

use crate::error::KiraError;
use crate::records::{RecordStore, ResultFile};

/// Feature x sample numeric table, stored column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: Vec<String>,
    columns: Vec<String>,
    data: Vec<Vec<f64>>,
}

/// Inner-joined frames of one aggregation key.
pub type MergedTable = Frame;

impl Frame {
    /// Builds a frame from per-column values. Every column must have one value per index entry.
    pub fn new(index: Vec<String>, columns: Vec<String>, data: Vec<Vec<f64>>) -> Result<Self, KiraError> {
        if columns.len() != data.len() {
            return Err(KiraError::InvalidFrame {
                path: "<memory>".to_string(),
                message: format!("{} column names for {} columns", columns.len(), data.len()),
            });
        }
        if let Some(bad) = data.iter().position(|column| column.len() != index.len()) {
            return Err(KiraError::InvalidFrame {
                path: "<memory>".to_string(),
                message: format!(
                    "column {} has {} values, index has {}",
                    columns[bad],
                    data[bad].len(),
                    index.len()
                ),
            });
        }
        Ok(Self { index, columns, data })
    }

    pub fn single(column: impl Into<String>, index: Vec<String>, values: Vec<f64>) -> Result<Self, KiraError> {
        Self::new(index, vec![column.into()], vec![values])
    }

    pub fn index(&self) -> &[String] {
        &self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, position: usize) -> &[f64] {
        &self.data[position]
    }

    pub fn column_by_name(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .position(|column| column == name)
            .map(|position| self.data[position].as_slice())
    }

    pub fn num_rows(&self) -> usize {
        self.index.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows(), self.num_columns())
    }

    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.data[column][row]
    }

    pub fn map_columns(&self, mut f: impl FnMut(&[f64]) -> Vec<f64>) -> Self {
        Self {
            index: self.index.clone(),
            columns: self.columns.clone(),
            data: self.data.iter().map(|column| f(column)).collect(),
        }
    }

    /// Swaps rows and columns: the index becomes the column names.
    pub fn transpose(&self) -> Self {
        let data = (0..self.num_rows())
            .map(|row| self.data.iter().map(|column| column[row]).collect())
            .collect();
        Self {
            index: self.columns.clone(),
            columns: self.index.clone(),
            data,
        }
    }

    /// Inner join on the feature index, keeping this frame's row order.
    pub fn inner_join(&self, other: &Frame) -> Frame {
        let positions: HashMap<&str, usize> = other
            .index
            .iter()
            .enumerate()
            .map(|(row, feature)| (feature.as_str(), row))
            .collect();
        let matches: Vec<(usize, usize)> = self
            .index
            .iter()
            .enumerate()
            .filter_map(|(row, feature)| positions.get(feature.as_str()).map(|other_row| (row, *other_row)))
            .collect();

        let index = matches.iter().map(|(row, _)| self.index[*row].clone()).collect();
        let mut data: Vec<Vec<f64>> = self
            .data
            .iter()
            .map(|column| matches.iter().map(|(row, _)| column[*row]).collect())
            .collect();
        data.extend(
            other
                .data
                .iter()
                .map(|column| matches.iter().map(|(_, row)| column[*row]).collect()),
        );
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());

        Frame { index, columns, data }
    }

    /// Tab-separated rendering with `index_label` heading the feature column.
    pub fn to_tsv(&self, index_label: &str) -> Result<Vec<u8>, KiraError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push(index_label.to_string());
        header.extend(self.columns.iter().cloned());
        writer
            .write_record(&header)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for (row, feature) in self.index.iter().enumerate() {
            let mut record = Vec::with_capacity(self.columns.len() + 1);
            record.push(feature.clone());
            record.extend(self.data.iter().map(|column| format_value(column[row])));
            writer
                .write_record(&record)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone)]
struct ParsedTable {
    index: Vec<String>,
    values: Vec<f64>,
    duplicates: usize,
}

/// Loads result files into single-column frames, caching parses per file id.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    cache: HashMap<u64, ParsedTable>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Loads `file`, naming its value column after `sample`. Duplicate feature ids are
    /// reported through `warnings`.
    pub fn load<S: RecordStore>(
        &mut self,
        store: &S,
        file: &ResultFile,
        sample: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Frame, KiraError> {
        if !self.cache.contains_key(&file.id) {
            let bytes = store.read_bytes(&file.path)?;
            let parsed = parse_table(&file.path, &bytes)?;
            self.cache.insert(file.id, parsed);
        }
        let parsed = &self.cache[&file.id];
        if parsed.duplicates > 0 {
            let message = format!(
                "{} duplicate feature ids dropped from {} ({sample})",
                parsed.duplicates, file.filename
            );
            warn!(path = %file.path, sample, duplicates = parsed.duplicates, "duplicate features in result file");
            warnings.push(message);
        }
        Frame::single(sample, parsed.index.clone(), parsed.values.clone())
    }
}

fn parse_table(path: &str, bytes: &[u8]) -> Result<ParsedTable, KiraError> {
    let invalid = |message: String| KiraError::InvalidFrame {
        path: path.to_string(),
        message,
    };

    let text = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| invalid(format!("gzip: {err}")))?;
        text
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|err| invalid(err.to_string()))?
    };

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| invalid("empty file".to_string()))?;
    if header.split('\t').count() < 2 {
        return Err(invalid("expected a feature column and a value column".to_string()));
    }

    let mut seen = HashSet::new();
    let mut index = Vec::new();
    let mut values = Vec::new();
    let mut duplicates = 0;
    for (line_no, line) in lines.enumerate() {
        let mut fields = line.split('\t');
        let feature = fields.next().unwrap_or_default().trim();
        let raw = fields
            .next()
            .ok_or_else(|| invalid(format!("line {} has no value", line_no + 2)))?
            .trim();
        let value = parse_value(raw)
            .ok_or_else(|| invalid(format!("line {}: non-numeric value {raw:?}", line_no + 2)))?;
        if !seen.insert(feature.to_string()) {
            duplicates += 1;
            continue;
        }
        index.push(feature.to_string());
        values.push(value);
    }

    if index.is_empty() {
        return Err(invalid("no data rows".to_string()));
    }
    Ok(ParsedTable {
        index,
        values,
        duplicates,
    })
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "" | "NA" | "NaN" | "nan" | "null" => Some(f64::NAN),
        _ => raw.parse::<f64>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn parses_plain_table() {
        let parsed = parse_table("a.tsv", b"Gene\tvalue\nG1\t1.5\nG2\tNA\n").unwrap();
        assert_eq!(parsed.index, vec!["G1", "G2"]);
        assert_eq!(parsed.values[0], 1.5);
        assert!(parsed.values[1].is_nan());
    }

    #[test]
    fn parses_gzip_table_and_drops_duplicates() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"Gene\tv\nG1\t1\nG1\t2\nG2\t3\n").unwrap();
        let bytes = encoder.finish().unwrap();

        let parsed = parse_table("a.tsv.gz", &bytes).unwrap();
        assert_eq!(parsed.index, vec!["G1", "G2"]);
        assert_eq!(parsed.values, vec![1.0, 3.0]);
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn rejects_bad_tables() {
        assert_matches!(parse_table("x", b""), Err(KiraError::InvalidFrame { .. }));
        assert_matches!(parse_table("x", b"Gene\tv\n"), Err(KiraError::InvalidFrame { .. }));
        assert_matches!(
            parse_table("x", b"Gene\tv\nG1\tabc\n"),
            Err(KiraError::InvalidFrame { .. })
        );
    }

    #[test]
    fn transpose_swaps_axes() {
        let frame = Frame::new(
            vec!["g1".into(), "g2".into(), "g3".into()],
            vec!["s1".into(), "s2".into()],
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        )
        .unwrap();
        let transposed = frame.transpose();
        assert_eq!(transposed.shape(), (2, 3));
        assert_eq!(transposed.value(1, 2), 6.0);
        assert_eq!(transposed.transpose(), frame);
    }
}
