//! `igsfit` orchestration.
//!
//! # Stages
//! 1. Input validation and output directory policy
//! 2. Optional taxdump refresh
//! 3. Metadata load and schema check
//! 4. Tree reconciliation, writing `tree.nwk` and `taxon_remap.tsv`
//! 5. Join & derive against the aggregated summary, writing `filtered.tsv`
//! 6. External model fit

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::aggregate::read_summary;
use crate::derive::derive;
use crate::error::{PipelineError, Result};
use crate::reconcile::{ReconcileConfig, Reconciler, Reconciliation, Remapping};
use crate::runner::ModelRunner;
use crate::table::TsvTable;
use crate::taxonomy::{update_taxdump, TaxId, TaxdumpGateway};

/// Metadata columns the model script reads.
pub const REQUIRED_COLUMNS: [&str; 4] = ["ncbi_taxid", "Species", "ncbi_name", "Genome_length"];
const TAXID_COLUMN: &str = "ncbi_taxid";
const TREE_TAXON_COLUMN: &str = "taxon_tree";
const DROPPED_COLUMN: &str = "GI";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub metadata: PathBuf,
    pub summary: PathBuf,
    pub output_dir: PathBuf,
    pub key_column: String,
    pub taxdump_dir: PathBuf,
    pub update_taxa: bool,
    pub reconcile: ReconcileConfig,
    pub rscript: String,
    pub model_script: PathBuf,
    pub skip_fit: bool,
    pub overwrite: bool,
}

/// Fixed artifact locations inside the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub tree: PathBuf,
    pub remap: PathBuf,
    pub filtered: PathBuf,
    pub fit_log: PathBuf,
    pub err_log: PathBuf,
    pub result: PathBuf,
    pub model: PathBuf,
    pub results_row: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            tree: dir.join("tree.nwk"),
            remap: dir.join("taxon_remap.tsv"),
            filtered: dir.join("filtered.tsv"),
            fit_log: dir.join("brms_fit.log"),
            err_log: dir.join("brms_err.log"),
            result: dir.join("brms_result.txt"),
            model: dir.join("brms_model.rds"),
            results_row: dir.join("brms_results_row.tsv"),
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Creates `dir`, or reuses it when `overwrite` is set.
pub fn prepare_output_dir(dir: &Path, overwrite: bool) -> Result<()> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(PipelineError::input(format!(
                "output path {} exists and is not a directory",
                dir.display()
            )));
        }
        if !overwrite {
            return Err(PipelineError::input(format!(
                "output directory {} already exists, use --overwrite to reuse it",
                dir.display()
            )));
        }
        warn!("Reusing existing output directory {}", dir.display());
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Reads the metadata table, checks its schema and drops the `GI` column.
pub fn load_metadata(path: &Path, key_column: &str) -> Result<TsvTable> {
    let mut table = TsvTable::read(path)?;
    let mut required: Vec<&str> = REQUIRED_COLUMNS.to_vec();
    required.push(key_column);
    table.require_columns(&required)?;
    if table.drop_column(DROPPED_COLUMN) {
        info!("Dropped {} column from metadata", DROPPED_COLUMN);
    }
    info!("Loaded {} metadata rows from {}", table.len(), path.display());
    Ok(table)
}

/// Parses the taxid column; every row must carry a valid identifier.
pub fn metadata_taxa(table: &TsvTable) -> Result<Vec<TaxId>> {
    let column = table
        .column(TAXID_COLUMN)
        .ok_or_else(|| PipelineError::invalid_data(format!("missing {} column", TAXID_COLUMN)))?;
    column
        .enumerate()
        .map(|(idx, value)| {
            value.parse::<TaxId>().map_err(|_| {
                PipelineError::parse(
                    table.path(),
                    idx + 2,
                    format!("invalid {} value '{}'", TAXID_COLUMN, value),
                )
            })
        })
        .collect()
}

/// Writes original → tree taxon pairs, one per distinct original taxon.
pub fn write_remapping(remapping: &Remapping, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}\t{}", TAXID_COLUMN, TREE_TAXON_COLUMN)?;
    for (original, current) in remapping.iter() {
        writeln!(writer, "{}\t{}", original, current)?;
    }
    writer.flush()?;
    Ok(())
}

fn reconcile_taxa(config: &PipelineConfig, taxa: &BTreeSet<TaxId>) -> Result<Reconciliation> {
    if config.update_taxa {
        update_taxdump(&config.taxdump_dir)?;
    }
    let gateway = TaxdumpGateway::load(&config.taxdump_dir)?;
    Reconciler::new(&gateway, config.reconcile.clone()).reconcile(taxa)
}

// ============================================================================
// Run
// ============================================================================

/// Runs every `igsfit` stage in order, returning the artifact locations.
pub fn run(config: &PipelineConfig) -> Result<ArtifactPaths> {
    let start = Instant::now();

    for (label, path) in [("metadata table", &config.metadata), ("summary table", &config.summary)] {
        if !path.is_file() {
            return Err(PipelineError::input(format!("{} not found: {}", label, path.display())));
        }
    }
    // Runner is resolved before any output is written.
    let runner = if config.skip_fit {
        None
    } else {
        Some(ModelRunner::new(&config.rscript, &config.model_script)?)
    };

    prepare_output_dir(&config.output_dir, config.overwrite)?;
    let paths = ArtifactPaths::in_dir(&config.output_dir);

    let mut metadata = load_metadata(&config.metadata, &config.key_column)?;
    let taxa = metadata_taxa(&metadata)?;
    let distinct: BTreeSet<TaxId> = taxa.iter().copied().collect();

    let reconciliation = reconcile_taxa(config, &distinct)?;
    reconciliation.tree.write_newick(&paths.tree)?;
    write_remapping(&reconciliation.remapping, &paths.remap)?;
    info!(
        "Tree written to {} after {} build(s), {} taxa substituted",
        paths.tree.display(),
        reconciliation.builds(),
        reconciliation.remapping.substituted().count()
    );

    let tree_taxa: Vec<String> = taxa
        .iter()
        .map(|&t| reconciliation.remapping.apply(t).to_string())
        .collect();
    metadata.set_column(TREE_TAXON_COLUMN, tree_taxa)?;

    let records = read_summary(&config.summary, &config.key_column)?;
    info!("Read {} summary rows from {}", records.len(), config.summary.display());
    let merged = derive(&records, &metadata, &config.key_column)?;
    merged.write(&paths.filtered)?;
    info!("Model table written to {}", paths.filtered.display());

    match runner {
        Some(runner) => runner.run(&paths)?,
        None => info!("Skipping model fit"),
    }

    info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(paths)
}
