//! Join & Derive Stage
//!
//! Left-joins the aggregated summary with per-sample metadata and adds the
//! two columns the model consumes: the binary polarity class and log10 of
//! the region length.
//!
//! Every summary row survives the join. Rows whose sample has no metadata
//! carry empty (null) metadata cells.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::aggregate::{sort_records, SUMMARY_COLUMNS};
use crate::error::{PipelineError, Result};
use crate::gff::AnnotationRecord;
use crate::table::TsvTable;

// ============================================================================
// Polarity
// ============================================================================

/// Co-directional or opposing orientation of the two flanking features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarityClass {
    Same,
    Opposite,
}

impl PolarityClass {
    /// Classifies a raw strand pair such as `+-`.
    pub fn from_strands(raw: &str) -> Option<Self> {
        match raw {
            "++" | "--" => Some(Self::Same),
            "+-" | "-+" => Some(Self::Opposite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Opposite => "opposite",
        }
    }
}

/// Polarity label for output; unrecognised strand pairs pass through as-is.
pub fn polarity_bin(raw: &str) -> &str {
    match PolarityClass::from_strands(raw) {
        Some(class) => class.as_str(),
        None => raw,
    }
}

// ============================================================================
// Merged Table
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergedRow {
    pub record: AnnotationRecord,
    /// Metadata cells in `MergedTable::metadata_columns` order, `None` when
    /// the sample had no metadata row.
    pub metadata: Option<Vec<String>>,
    pub polarity_bin: String,
    pub log10_length: f64,
}

#[derive(Debug, Clone)]
pub struct MergedTable {
    pub key_column: String,
    pub metadata_columns: Vec<String>,
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Output header: summary columns, metadata columns, derived columns.
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect();
        header[1] = self.key_column.clone();
        header.extend(self.metadata_columns.iter().cloned());
        header.push("polarity_bin".to_string());
        header.push("log10_length".to_string());
        header
    }

    /// Metadata cell for `column` in `row`, `None` if unmatched or absent.
    pub fn metadata_value<'a>(&self, row: &'a MergedRow, column: &str) -> Option<&'a str> {
        let idx = self.metadata_columns.iter().position(|c| c == column)?;
        row.metadata.as_ref().map(|cells| cells[idx].as_str())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", self.header().join("\t"))?;

        let empty = vec![String::new(); self.metadata_columns.len()];
        for row in &self.rows {
            let r = &row.record;
            let metadata = row.metadata.as_ref().unwrap_or(&empty);
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}{}\t{}",
                r.id,
                r.sample,
                r.up,
                r.down,
                r.pair,
                r.polarity,
                r.length,
                u8::from(r.merged),
                r.source_up.as_deref().unwrap_or(""),
                r.source_down.as_deref().unwrap_or(""),
                metadata.iter().map(|m| format!("{}\t", m)).collect::<String>(),
                row.polarity_bin,
                row.log10_length,
            )?;
        }
        out.flush()?;
        Ok(())
    }
}

// ============================================================================
// Join
// ============================================================================

/// Left-joins `records` with `metadata` on `key_column` and derives the
/// model columns. Output is sorted by (sample, ID).
///
/// When several metadata rows share a key the first one is used, so the
/// output always has exactly one row per record.
///
/// # Errors
/// `PipelineError::Schema` if `metadata` lacks `key_column`.
pub fn derive(records: &[AnnotationRecord], metadata: &TsvTable, key_column: &str) -> Result<MergedTable> {
    metadata.require_columns(&[key_column])?;
    let key_idx = metadata
        .column_index(key_column)
        .ok_or_else(|| PipelineError::invalid_data(format!("missing key column {}", key_column)))?;

    // Metadata columns other than the key, renamed on collision.
    let mut summary_columns: [&str; 10] = SUMMARY_COLUMNS;
    summary_columns[1] = key_column;
    let kept: Vec<usize> = (0..metadata.header().len()).filter(|&i| i != key_idx).collect();
    let metadata_columns: Vec<String> = kept
        .iter()
        .map(|&i| {
            let name = &metadata.header()[i];
            if summary_columns.contains(&name.as_str()) {
                format!("{}_right", name)
            } else {
                name.clone()
            }
        })
        .collect();

    let mut lookup: FxHashMap<&str, &[String]> = FxHashMap::default();
    let mut duplicate_keys = 0usize;
    for row in metadata.rows() {
        if lookup.contains_key(row[key_idx].as_str()) {
            duplicate_keys += 1;
        } else {
            lookup.insert(row[key_idx].as_str(), row.as_slice());
        }
    }
    if duplicate_keys > 0 {
        warn!("{} duplicate {} value(s) in metadata, first row kept", duplicate_keys, key_column);
    }

    let mut sorted = records.to_vec();
    sort_records(&mut sorted);

    let mut unmatched = 0usize;
    let rows: Vec<MergedRow> = sorted
        .into_iter()
        .map(|record| {
            let metadata = lookup
                .get(record.sample.as_str())
                .map(|row| kept.iter().map(|&i| row[i].clone()).collect());
            if metadata.is_none() {
                unmatched += 1;
            }
            MergedRow {
                polarity_bin: polarity_bin(&record.polarity).to_string(),
                log10_length: (record.length as f64).log10(),
                metadata,
                record,
            }
        })
        .collect();

    if unmatched > 0 {
        warn!("{} summary row(s) without metadata", unmatched);
    }
    info!("Joined {} summary rows with {} metadata rows", rows.len(), metadata.len());

    Ok(MergedTable {
        key_column: key_column.to_string(),
        metadata_columns,
        rows,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sample: &str, id: &str, polarity: &str, length: u64) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            sample: sample.to_string(),
            up: "a".into(),
            down: "b".into(),
            pair: "a-b".into(),
            polarity: polarity.to_string(),
            length,
            merged: false,
            source_up: None,
            source_down: None,
        }
    }

    fn metadata() -> TsvTable {
        TsvTable::from_parts(
            vec!["AN".into(), "Species".into(), "ID".into()],
            vec![
                vec!["A".into(), "E. coli".into(), "m1".into()],
                vec!["A".into(), "dup".into(), "m2".into()],
                vec!["B".into(), "B. subtilis".into(), "m3".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_polarity_classes() {
        assert_eq!(polarity_bin("+-"), "opposite");
        assert_eq!(polarity_bin("-+"), "opposite");
        assert_eq!(polarity_bin("++"), "same");
        assert_eq!(polarity_bin("--"), "same");
        assert_eq!(polarity_bin("+?"), "+?");
    }

    #[test]
    fn test_left_join_preserves_rows() {
        let records = vec![
            record("C", "1", "++", 100),
            record("A", "2", "+-", 10),
            record("A", "1", "++", 1000),
        ];
        let merged = derive(&records, &metadata(), "AN").unwrap();

        assert_eq!(merged.len(), records.len());
        let keys: Vec<(&str, &str)> = merged.rows.iter().map(|r| r.record.key()).collect();
        assert_eq!(keys, vec![("A", "1"), ("A", "2"), ("C", "1")]);

        let first = &merged.rows[0];
        assert_eq!(merged.metadata_value(first, "Species"), Some("E. coli"));
        assert_eq!(merged.metadata_value(&merged.rows[2], "Species"), None);
        assert_eq!(first.polarity_bin, "same");
        assert!((first.log10_length - 3.0).abs() < 1e-12);
        assert_eq!(merged.rows[1].polarity_bin, "opposite");
    }

    #[test]
    fn test_colliding_metadata_column_renamed() {
        let merged = derive(&[record("A", "1", "++", 10)], &metadata(), "AN").unwrap();
        assert_eq!(merged.metadata_columns, vec!["Species".to_string(), "ID_right".to_string()]);
        assert_eq!(merged.header().last().map(String::as_str), Some("log10_length"));
    }

    #[test]
    fn test_collision_uses_actual_key_column() {
        let metadata = TsvTable::from_parts(
            vec!["accession".into(), "AN".into(), "Pair".into()],
            vec![vec!["A".into(), "legacy".into(), "p".into()]],
        )
        .unwrap();
        let merged = derive(&[record("A", "1", "++", 10)], &metadata, "accession").unwrap();
        assert_eq!(merged.metadata_columns, vec!["AN".to_string(), "Pair_right".to_string()]);
        assert_eq!(merged.metadata_value(&merged.rows[0], "AN"), Some("legacy"));
    }

    #[test]
    fn test_missing_key_column() {
        let err = derive(&[], &metadata(), "accession").err().unwrap();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn test_write_nulls_as_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filtered.tsv");
        let merged = derive(&[record("Z", "1", "+-", 10)], &metadata(), "AN").unwrap();
        merged.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "ID\tAN\tUP\tDOWN\tPair\tPolarity\tLength\tMerged\tsource_up\tsource_dw\tSpecies\tID_right\tpolarity_bin\tlog10_length"
        );
        assert_eq!(lines[1], "1\tZ\ta\tb\ta-b\t+-\t10\t0\t\t\t\t\topposite\t1");
    }
}
