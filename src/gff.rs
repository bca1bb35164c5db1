//! Intergenic GFF3 Record Extraction
//!
//! Turns one sample's intergenic-region GFF3 file into summary records. The
//! extraction is purely syntactic and keeps no state between calls, so any
//! number of samples can be extracted concurrently.
//!
//! # GFF3 Columns Used
//! ```text
//! Col  Name        Use
//! 3    type        "intergenic_region" marks unmerged regions
//! 4    start       1-based inclusive
//! 5    end         1-based inclusive
//! 9    attributes  ID, neighbour names and neighbour source descriptors
//! ```
//!
//! # Example
//! ```no_run
//! use igsfit::gff::AttributeExtractor;
//!
//! let extractor = AttributeExtractor::with_default_keys().unwrap();
//! let records = extractor.extract("GCF_000005845.2", "GCF_000005845.2_intergenic.gff3".as_ref()).unwrap();
//! println!("{} intergenic regions", records.len());
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use regex::Regex;

use crate::error::{PipelineError, Result};

/// Feature type of regions that were not merged with a neighbour.
pub const INTERGENIC_TYPE: &str = "intergenic_region";
/// Upstream label when a region touches the start of its sequence.
pub const SEQUENCE_START: &str = "RS";
/// Downstream label when a region touches the end of its sequence.
pub const SEQUENCE_END: &str = "RE";
/// Strand assumed when a source descriptor carries none.
pub const DEFAULT_STRAND: char = '+';

/// Strand character inside a source descriptor such as `dnaA|+|1`.
const STRAND_PATTERN: &str = r"\|([+-])\|";

// ============================================================================
// Annotation Record
// ============================================================================

/// One intergenic region of one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRecord {
    /// Feature `ID` attribute.
    pub id: String,
    /// Sample (assembly accession) the file belongs to.
    pub sample: String,
    /// Upstream neighbour name, [`SEQUENCE_START`] when absent.
    pub up: String,
    /// Downstream neighbour name, [`SEQUENCE_END`] when absent.
    pub down: String,
    /// `up-down`.
    pub pair: String,
    /// Upstream strand followed by downstream strand, e.g. `+-`.
    pub polarity: String,
    /// `end - start + 1`.
    pub length: u64,
    /// False only for plain `intergenic_region` rows.
    pub merged: bool,
    pub source_up: Option<String>,
    pub source_down: Option<String>,
}

impl AnnotationRecord {
    /// Sort key of the aggregated table.
    pub fn key(&self) -> (&str, &str) {
        (&self.sample, &self.id)
    }
}

// ============================================================================
// Attribute Extraction
// ============================================================================

/// Attribute names holding neighbour information.
#[derive(Debug, Clone)]
pub struct AttributeKeys {
    pub name_up: String,
    pub name_down: String,
    pub source_up: String,
    pub source_down: String,
}

impl Default for AttributeKeys {
    fn default() -> Self {
        Self {
            name_up: "name_left".to_string(),
            name_down: "name_right".to_string(),
            source_up: "source_left".to_string(),
            source_down: "source_right".to_string(),
        }
    }
}

/// Compiled attribute lookups for a set of [`AttributeKeys`].
#[derive(Debug, Clone)]
pub struct AttributeExtractor {
    id: Regex,
    name_up: Regex,
    name_down: Regex,
    source_up: Regex,
    source_down: Regex,
    strand: Regex,
}

fn attribute_pattern(key: &str) -> Result<Regex> {
    Regex::new(&format!(r"(?:^|;)\s*{}=([^;]+)", regex::escape(key)))
        .map_err(|e| PipelineError::input(format!("invalid attribute key {:?}: {}", key, e)))
}

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

impl AttributeExtractor {
    pub fn new(keys: &AttributeKeys) -> Result<Self> {
        Ok(Self {
            id: attribute_pattern("ID")?,
            name_up: attribute_pattern(&keys.name_up)?,
            name_down: attribute_pattern(&keys.name_down)?,
            source_up: attribute_pattern(&keys.source_up)?,
            source_down: attribute_pattern(&keys.source_down)?,
            strand: Regex::new(STRAND_PATTERN)
                .map_err(|e| PipelineError::invalid_data(format!("invalid strand pattern: {}", e)))?,
        })
    }

    pub fn with_default_keys() -> Result<Self> {
        Self::new(&AttributeKeys::default())
    }

    fn strand_of(&self, source: Option<&str>) -> char {
        source
            .and_then(|s| capture(&self.strand, s))
            .and_then(|s| s.chars().next())
            .unwrap_or(DEFAULT_STRAND)
    }

    /// Parses one GFF3 data line into a record.
    ///
    /// # Errors
    /// Returns the failure reason if the line has fewer than 9 columns,
    /// non-integer or inverted coordinates, or no `ID` attribute.
    pub fn parse_line(&self, sample: &str, line: &str) -> std::result::Result<AnnotationRecord, String> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 9 {
            return Err(format!("expected 9 GFF3 columns, found {}", fields.len()));
        }

        let feature_type = fields[2];
        let start: u64 = fields[3]
            .trim()
            .parse()
            .map_err(|_| format!("invalid start {:?}", fields[3]))?;
        let end: u64 = fields[4]
            .trim()
            .parse()
            .map_err(|_| format!("invalid end {:?}", fields[4]))?;
        if end < start {
            return Err(format!("end {} before start {}", end, start));
        }

        let attributes = fields[8];
        let id = capture(&self.id, attributes).ok_or("missing ID attribute")?;

        let up = capture(&self.name_up, attributes).unwrap_or(SEQUENCE_START);
        let down = capture(&self.name_down, attributes).unwrap_or(SEQUENCE_END);
        let source_up = capture(&self.source_up, attributes);
        let source_down = capture(&self.source_down, attributes);

        let mut polarity = String::with_capacity(2);
        polarity.push(self.strand_of(source_up));
        polarity.push(self.strand_of(source_down));

        Ok(AnnotationRecord {
            id: id.to_string(),
            sample: sample.to_string(),
            up: up.to_string(),
            down: down.to_string(),
            pair: format!("{}-{}", up, down),
            polarity,
            length: end - start + 1,
            merged: feature_type != INTERGENIC_TYPE,
            source_up: source_up.map(str::to_string),
            source_down: source_down.map(str::to_string),
        })
    }

    /// Extracts every record of a sample's GFF3 file (plain or `.gz`).
    ///
    /// Comment lines and blank lines are skipped; a `##FASTA` directive ends
    /// the feature section.
    ///
    /// # Errors
    /// The first malformed line aborts the whole file with
    /// `PipelineError::Parse`.
    pub fn extract(&self, sample: &str, path: &Path) -> Result<Vec<AnnotationRecord>> {
        let reader = open_text(path)?;
        let mut records = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.starts_with("##FASTA") {
                break;
            }
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let record = self
                .parse_line(sample, &line)
                .map_err(|msg| PipelineError::parse(path, idx + 1, msg))?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Extracts records with the default attribute keys.
///
/// Compiles the attribute patterns on every call; reuse an
/// [`AttributeExtractor`] when extracting many files.
pub fn extract(sample: &str, path: &Path) -> Result<Vec<AnnotationRecord>> {
    AttributeExtractor::with_default_keys()?.extract(sample, path)
}

/// Opens a text file, decompressing when the name ends in `.gz`.
fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| {
        PipelineError::input(format!("failed to open {}: {}", path.display(), e))
    })?;
    let is_gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
    if is_gz {
        Ok(Box::new(BufReader::with_capacity(
            1024 * 1024,
            MultiGzDecoder::new(file),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(1024 * 1024, file)))
    }
}

// ============================================================================
// Tests
// ============================================================================
