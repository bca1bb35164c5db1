//! igsfit - Intergenic Spacer Model Preparation
//!
//! Aggregates per-sample intergenic annotations into one summary table and
//! prepares the inputs of a phylogenetic regression: a reference-taxonomy
//! tree reconciled against the samples' taxa and a joined, derived table.
//!
//! # Modules
//! - `error`: shared error type
//! - `tree`: arena tree with ultrametric rescaling and Newick output
//! - `taxonomy`: NCBI taxdump gateway and download
//! - `reconcile`: bounded tree/taxa reconciliation with descendant substitution
//! - `gff`: intergenic GFF attribute extraction
//! - `table`: headered TSV tables
//! - `aggregate`: parallel per-sample extraction into a sorted summary
//! - `derive`: metadata left join and derived model columns
//! - `runner`: external model-fitting subprocess
//! - `pipeline`: `igsfit` stage orchestration
//! - `logging`: tracing subscriber setup

pub mod error;
pub mod tree;
pub mod taxonomy;
pub mod reconcile;
pub mod gff;
pub mod table;
pub mod aggregate;
pub mod derive;
pub mod runner;
pub mod pipeline;
pub mod logging;

pub use error::{PipelineError, Result};
