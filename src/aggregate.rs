//! Parallel Summary Aggregation
//!
//! Fans per-sample extraction out over a fixed-size worker pool and merges
//! the results into one table sorted by (sample, ID).
//!
//! # Execution Model
//! - Every sample becomes one task, all spawned up front into a dedicated
//!   rayon pool.
//! - Results travel over a channel in completion order; the final sort makes
//!   the output independent of that order.
//! - The first failing task raises an abort flag; tasks that have not started
//!   yet return without extracting. The caller gets the error, never a
//!   partial table.
//! - The caller blocks until every task has reported.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::gff::AnnotationRecord;
use crate::table::TsvTable;

/// Column names of the aggregated summary, with the sample column second.
pub const SUMMARY_COLUMNS: [&str; 10] = [
    "ID",
    "AN",
    "UP",
    "DOWN",
    "Pair",
    "Polarity",
    "Length",
    "Merged",
    "source_up",
    "source_dw",
];

// ============================================================================
// Sample File Layout
// ============================================================================

/// Locates per-sample annotation files as `<dir>/<sample><suffix><ext>`.
#[derive(Debug, Clone)]
pub struct SampleFiles {
    pub dir: PathBuf,
    pub suffix: String,
    pub ext: String,
}

impl SampleFiles {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
            ext: ext.into(),
        }
    }

    pub fn path_for(&self, sample: &str) -> PathBuf {
        self.dir.join(format!("{}{}{}", sample, self.suffix, self.ext))
    }

    /// Pairs every sample with its file, failing before any work starts if
    /// one of them does not exist.
    pub fn resolve_all<S: AsRef<str>>(&self, samples: &[S]) -> Result<Vec<(String, PathBuf)>> {
        let mut resolved = Vec::with_capacity(samples.len());
        let mut missing = Vec::new();

        for sample in samples {
            let sample = sample.as_ref();
            let path = self.path_for(sample);
            if path.is_file() {
                resolved.push((sample.to_string(), path));
            } else {
                missing.push(path);
            }
        }

        if !missing.is_empty() {
            let shown: Vec<String> = missing.iter().take(5).map(|p| p.display().to_string()).collect();
            return Err(PipelineError::input(format!(
                "{} annotation file(s) not found, e.g. {}",
                missing.len(),
                shown.join(", ")
            )));
        }
        Ok(resolved)
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Resolves a requested worker count; 0 means one per logical CPU.
pub fn effective_workers(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}

/// Runs `extractor` for every `(sample, path)` on `workers` threads and
/// returns all records sorted by (sample, ID).
///
/// # Errors
/// The first extraction error (in completion order) is returned; no records
/// are returned alongside it.
pub fn aggregate<F>(samples: &[(String, PathBuf)], extractor: F, workers: usize) -> Result<Vec<AnnotationRecord>>
where
    F: Fn(&str, &Path) -> Result<Vec<AnnotationRecord>> + Sync,
{
    let workers = effective_workers(workers);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("igs-worker-{}", i))
        .build()
        .map_err(|e| PipelineError::input(format!("failed to create worker pool: {}", e)))?;

    info!("Starting processing {} samples with {} workers...", samples.len(), workers);

    let total = samples.len();
    let abort = AtomicBool::new(false);
    let finished = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, Option<Result<Vec<AnnotationRecord>>>)>();

    pool.scope(|s| {
        for (idx, (sample, path)) in samples.iter().enumerate() {
            let tx = tx.clone();
            let abort = &abort;
            let finished = &finished;
            let extractor = &extractor;

            s.spawn(move |_| {
                if abort.load(Ordering::Acquire) {
                    let _ = tx.send((idx, None));
                    return;
                }

                let result = extractor(sample, path);
                if result.is_err() {
                    abort.store(true, Ordering::Release);
                }

                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                if total >= 10 && done % (total / 10) == 0 {
                    debug!("Extracted {}/{} samples", done, total);
                }
                let _ = tx.send((idx, Some(result)));
            });
        }
        debug!("Tasks submitted, waiting for completion...");
    });
    drop(tx);

    let mut records = Vec::new();
    let mut first_error = None;
    let mut skipped = 0usize;

    for (idx, outcome) in rx {
        match outcome {
            Some(Ok(batch)) => records.extend(batch),
            Some(Err(e)) => {
                error!("Extraction failed for {}: {}", samples[idx].0, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            None => skipped += 1,
        }
    }

    if let Some(e) = first_error {
        if skipped > 0 {
            warn!("{} sample(s) not started after the failure", skipped);
        }
        return Err(e);
    }

    sort_records(&mut records);
    let duplicates = count_duplicates(&records);
    if duplicates > 0 {
        warn!("{} duplicate (sample, ID) pair(s) in aggregated table", duplicates);
    }

    info!("Aggregated {} records from {} samples", records.len(), total);
    Ok(records)
}

pub fn sort_records(records: &mut [AnnotationRecord]) {
    records.sort_by(|a, b| a.key().cmp(&b.key()));
}

fn count_duplicates(sorted: &[AnnotationRecord]) -> usize {
    sorted.windows(2).filter(|w| w[0].key() == w[1].key()).count()
}

// ============================================================================
// Summary Table I/O
// ============================================================================

fn summary_header(key_column: &str) -> Vec<&str> {
    let mut header = SUMMARY_COLUMNS.to_vec();
    header[1] = key_column;
    header
}

/// Writes the aggregated table; the sample column is named `key_column`.
pub fn write_summary(records: &[AnnotationRecord], path: &Path, key_column: &str) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", summary_header(key_column).join("\t"))?;
    for r in records {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
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
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Reads a summary written by [`write_summary`].
pub fn read_summary(path: &Path, key_column: &str) -> Result<Vec<AnnotationRecord>> {
    let table = TsvTable::read(path)?;
    let header = summary_header(key_column);
    table.require_columns(&header)?;

    let col = |name: &str| table.column_index(name).unwrap_or_default();
    let idx: Vec<usize> = header.iter().map(|&h| col(h)).collect();
    let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());

    table
        .rows()
        .iter()
        .enumerate()
        .map(|(n, row)| {
            let line = n + 2;
            let length = row[idx[6]]
                .parse::<u64>()
                .map_err(|_| PipelineError::parse(path, line, format!("invalid Length {:?}", row[idx[6]])))?;
            let merged = match row[idx[7]].as_str() {
                "1" | "true" | "True" => true,
                "0" | "false" | "False" => false,
                other => {
                    return Err(PipelineError::parse(path, line, format!("invalid Merged {:?}", other)))
                }
            };
            Ok(AnnotationRecord {
                id: row[idx[0]].clone(),
                sample: row[idx[1]].clone(),
                up: row[idx[2]].clone(),
                down: row[idx[3]].clone(),
                pair: row[idx[4]].clone(),
                polarity: row[idx[5]].clone(),
                length,
                merged,
                source_up: optional(&row[idx[8]]),
                source_down: optional(&row[idx[9]]),
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(sample: &str, id: &str) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            sample: sample.to_string(),
            up: "a".into(),
            down: "b".into(),
            pair: "a-b".into(),
            polarity: "+-".into(),
            length: 10,
            merged: false,
            source_up: Some("g|+|1".into()),
            source_down: None,
        }
    }

    fn samples(n: usize) -> Vec<(String, PathBuf)> {
        (0..n)
            .map(|i| (format!("S{}", i), PathBuf::from(format!("S{}.gff3", i))))
            .collect()
    }

    /// Extractor whose task duration depends on the sample, so completion
    /// order differs from submission order.
    fn delayed(reverse: bool) -> impl Fn(&str, &Path) -> Result<Vec<AnnotationRecord>> + Sync {
        move |sample: &str, _path: &Path| {
            let n: u64 = sample[1..].parse().unwrap();
            let delay = if reverse { 8 - n } else { n };
            std::thread::sleep(Duration::from_millis(delay * 3));
            Ok(vec![record(sample, "igs_2"), record(sample, "igs_1")])
        }
    }

    #[test]
    fn test_output_independent_of_completion_order() {
        let input = samples(8);
        let forward = aggregate(&input, delayed(false), 4).unwrap();
        let reverse = aggregate(&input, delayed(true), 4).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward.len(), 16);
        assert_eq!(forward[0].key(), ("S0", "igs_1"));
        assert_eq!(forward[15].key(), ("S7", "igs_2"));
    }

    #[test]
    fn test_failure_aborts_aggregation() {
        let input = samples(6);
        let result = aggregate(
            &input,
            |sample: &str, path: &Path| {
                if sample == "S3" {
                    Err(PipelineError::parse(path, 7, "broken"))
                } else {
                    Ok(vec![record(sample, "igs_1")])
                }
            },
            2,
        );
        match result {
            Err(PipelineError::Parse { line, .. }) => assert_eq!(line, 7),
            other => panic!("expected parse error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_failure_skips_unstarted_tasks() {
        let calls = AtomicUsize::new(0);
        let input = samples(5);
        let result = aggregate(
            &input,
            |_sample: &str, path: &Path| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::parse(path, 1, "broken"))
            },
            1,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single worker stops after first failure");
    }

    #[test]
    fn test_empty_input() {
        let records = aggregate(&[], delayed(false), 2).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_count_duplicates() {
        let mut records = vec![record("A", "1"), record("A", "1"), record("B", "1")];
        sort_records(&mut records);
        assert_eq!(count_duplicates(&records), 1);
    }

    #[test]
    fn test_sample_files_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GCF_1_intergenic.gff3"), "").unwrap();
        let files = SampleFiles::new(dir.path(), "_intergenic", ".gff3");

        assert_eq!(
            files.path_for("GCF_1"),
            dir.path().join("GCF_1_intergenic.gff3")
        );
        let resolved = files.resolve_all(&["GCF_1"]).unwrap();
        assert_eq!(resolved[0].0, "GCF_1");

        let err = files.resolve_all(&["GCF_1", "GCF_2"]).err().unwrap();
        assert!(err.to_string().contains("1 annotation file(s) not found"));
    }

    #[test]
    fn test_summary_roundtrip_with_custom_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.tsv");
        let records = vec![record("A", "1"), record("B", "2")];
        write_summary(&records, &path, "accession").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ID\taccession\tUP\t"));
        assert_eq!(read_summary(&path, "accession").unwrap(), records);
        assert!(matches!(
            read_summary(&path, "AN"),
            Err(PipelineError::Schema { .. })
        ));
    }
}
