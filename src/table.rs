//! Headered tab-separated tables.
//!
//! Used for the per-sample metadata table, which carries an open-ended set of
//! columns. Cells are kept as strings; an empty cell is a null.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct TsvTable {
    path: PathBuf,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// Reads a tab-separated file whose first line is the header.
    ///
    /// # Errors
    /// - `PipelineError::Input` if the file cannot be opened
    /// - `PipelineError::Parse` if the file is empty or a row has a
    ///   different number of fields than the header
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::input(format!("failed to open {}: {}", path.display(), e))
        })?;
        let mut lines = BufReader::new(file).lines();

        let header: Vec<String> = match lines.next() {
            Some(line) => line?.split('\t').map(|s| s.trim().to_string()).collect(),
            None => return Err(PipelineError::parse(path, 1, "empty table, expected a header")),
        };

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Vec<String> = line.split('\t').map(str::to_string).collect();
            if row.len() != header.len() {
                return Err(PipelineError::parse(
                    path,
                    idx + 2,
                    format!("expected {} fields, found {}", header.len(), row.len()),
                ));
            }
            rows.push(row);
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
        })
    }

    /// Builds an in-memory table; rows must match the header width.
    pub fn from_parts(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|r| r.len() != header.len()) {
            return Err(PipelineError::invalid_data(format!(
                "row {} has {} fields, header has {}",
                bad,
                rows[bad].len(),
                header.len()
            )));
        }
        Ok(Self {
            path: PathBuf::from("<memory>"),
            header,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| r[idx].as_str()))
    }

    /// Fails with `PipelineError::Schema` naming every absent column.
    pub fn require_columns(&self, names: &[&str]) -> Result<()> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| self.column_index(n).is_none())
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Schema {
                path: self.path.clone(),
                missing,
            })
        }
    }

    /// Removes a column; returns whether it existed.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        self.header.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    /// Appends a column, replacing any existing column of the same name.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(PipelineError::invalid_data(format!(
                "column {} has {} values for {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.header.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.tsv", "AN\tncbi_taxid\nA1\t562\nA2\t\n\n");
        let table = TsvTable::read(&path).unwrap();
        assert_eq!(table.len(), 2);
        let taxa: Vec<&str> = table.column("ncbi_taxid").unwrap().collect();
        assert_eq!(taxa, vec!["562", ""]);
        assert!(table.column("GI").is_none());
    }

    #[test]
    fn test_ragged_row_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.tsv", "AN\tncbi_taxid\nA1\n");
        match TsvTable::read(&path) {
            Err(PipelineError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn test_require_columns_lists_missing() {
        let table = TsvTable::from_parts(vec!["AN".into()], vec![]).unwrap();
        match table.require_columns(&["AN", "Species", "ncbi_taxid"]) {
            Err(PipelineError::Schema { missing, .. }) => {
                assert_eq!(missing, vec!["Species".to_string(), "ncbi_taxid".to_string()])
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_and_set_column() {
        let mut table = TsvTable::from_parts(
            vec!["AN".into(), "GI".into()],
            vec![vec!["A1".into(), "x".into()]],
        )
        .unwrap();
        assert!(table.drop_column("GI"));
        assert!(!table.drop_column("GI"));
        table.set_column("taxon_tree", vec!["562".into()]).unwrap();
        table.set_column("taxon_tree", vec!["563".into()]).unwrap();
        assert_eq!(table.header(), &["AN".to_string(), "taxon_tree".to_string()]);
        assert_eq!(table.rows()[0][1], "563");
        assert!(table.set_column("bad", vec![]).is_err());
    }
}
