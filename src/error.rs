//! Error types shared by the reconciliation, aggregation and fitting stages.
//!
//! Every variant is fatal for the run. Informational anomalies (extra taxa in a
//! generated tree, duplicate summary rows) are logged, never returned.

use std::path::PathBuf;
use thiserror::Error;

use crate::taxonomy::TaxId;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input table lacks columns the pipeline depends on
    #[error("{} is missing required columns: {}", path.display(), missing.join(", "))]
    Schema { path: PathBuf, missing: Vec<String> },

    /// Malformed annotation or table row
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Tree still disagrees with the dataset after every substitution round
    #[error(
        "taxa still missing from tree after {rounds} substitution round(s): {}",
        format_taxa(missing)
    )]
    Exhausted { rounds: usize, missing: Vec<TaxId> },

    /// Model-fitting subprocess exited unsuccessfully
    #[error("model runner failed (exit code: {code:?}), see {}", log.display())]
    ModelRunner { code: Option<i32>, log: PathBuf },

    /// Taxonomy database problems (missing dump files, download failures)
    #[error("Taxonomy error: {message}")]
    Taxonomy { message: String },

    /// Invalid values inside otherwise well-formed input
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Bad paths or options supplied by the caller
    #[error("Input error: {message}")]
    Input { message: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn taxonomy(message: impl Into<String>) -> Self {
        Self::Taxonomy {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }
}

fn format_taxa(taxa: &[TaxId]) -> String {
    taxa.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_lists_taxa() {
        let err = PipelineError::Exhausted {
            rounds: 2,
            missing: vec![TaxId(9606), TaxId(10090)],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 substitution round(s)"));
        assert!(msg.contains("9606, 10090"));
    }

    #[test]
    fn test_schema_message() {
        let err = PipelineError::Schema {
            path: PathBuf::from("meta.tsv"),
            missing: vec!["Species".into(), "ncbi_taxid".into()],
        };
        assert_eq!(
            err.to_string(),
            "meta.tsv is missing required columns: Species, ncbi_taxid"
        );
    }
}
