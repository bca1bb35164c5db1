//! Taxonomy Gateway Module
//!
//! Answers the two questions the tree reconciler asks of a reference
//! taxonomy: "what is the topology connecting these taxa?" and "what is one
//! representative child of each of these taxa?".
//!
//! The reconciler only sees the [`TaxonomyGateway`] trait. [`TaxdumpGateway`]
//! implements it over the NCBI taxdump files:
//! - `nodes.dmp`: `tax_id | parent_tax_id | rank | ...`
//! - `merged.dmp` (optional): `old_tax_id | new_tax_id |`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use flate2::read::GzDecoder;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::tree::Tree;

const NCBI_TAXDUMP_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pub/taxonomy/taxdump.tar.gz";

/// Upper bound on lineage length; NCBI lineages are far shorter.
const MAX_LINEAGE_DEPTH: usize = 256;

// ============================================================================
// Taxon Identifier
// ============================================================================

/// NCBI taxonomy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaxId(pub u32);

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaxId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(TaxId)
    }
}

// ============================================================================
// Gateway Trait
// ============================================================================

/// Reference taxonomy as seen by the reconciler.
pub trait TaxonomyGateway {
    /// Topology whose leaves are the requested taxa the taxonomy can place.
    fn build_tree(&self, taxa: &BTreeSet<TaxId>) -> Result<Tree>;

    /// For each parent with at least one child, its numerically smallest
    /// child. Parents without children are absent from the result.
    fn first_descendants(&self, parents: &BTreeSet<TaxId>) -> Result<BTreeMap<TaxId, TaxId>>;

    /// Equal root-to-leaf distance form required by the model.
    fn ultrametricize(&self, mut tree: Tree) -> Tree {
        tree.to_ultrametric();
        tree
    }
}

// ============================================================================
// Taxdump Gateway
// ============================================================================

/// In-memory NCBI taxonomy loaded from taxdump files.
pub struct TaxdumpGateway {
    /// taxid → parent taxid (the root points to itself)
    parents: FxHashMap<TaxId, TaxId>,
    /// parent taxid → child taxids
    children: FxHashMap<TaxId, Vec<TaxId>>,
    /// retired taxid → current taxid
    merged: FxHashMap<TaxId, TaxId>,
}

impl TaxdumpGateway {
    /// Builds a gateway from `(taxid, parent)` pairs. A node whose parent is
    /// itself is a root.
    pub fn from_parents(edges: impl IntoIterator<Item = (TaxId, TaxId)>) -> Self {
        let mut parents = FxHashMap::default();
        let mut children: FxHashMap<TaxId, Vec<TaxId>> = FxHashMap::default();
        for (taxid, parent) in edges {
            parents.insert(taxid, parent);
            if taxid != parent {
                children.entry(parent).or_default().push(taxid);
            }
        }
        Self {
            parents,
            children,
            merged: FxHashMap::default(),
        }
    }

    /// Registers retired → current taxid translations.
    pub fn with_merged(mut self, merged: impl IntoIterator<Item = (TaxId, TaxId)>) -> Self {
        self.merged.extend(merged);
        self
    }

    /// Loads `nodes.dmp` (required) and `merged.dmp` (optional) from a
    /// taxdump directory.
    pub fn load(taxdump_dir: &Path) -> Result<Self> {
        let nodes_path = taxdump_dir.join("nodes.dmp");
        if !nodes_path.exists() {
            return Err(PipelineError::taxonomy(format!(
                "nodes.dmp not found in {} (use --update-taxa to download it)",
                taxdump_dir.display()
            )));
        }

        info!("Loading {}", nodes_path.display());
        let edges = read_dmp_pairs(&nodes_path)?;
        let mut gateway = Self::from_parents(edges);

        let merged_path = taxdump_dir.join("merged.dmp");
        if merged_path.exists() {
            gateway = gateway.with_merged(read_dmp_pairs(&merged_path)?);
        }

        info!(
            nodes = gateway.parents.len(),
            merged = gateway.merged.len(),
            "Taxonomy loaded"
        );
        Ok(gateway)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Current taxid for `taxid`, following `merged.dmp`, if it is known.
    fn resolve(&self, taxid: TaxId) -> Option<TaxId> {
        let current = self.merged.get(&taxid).copied().unwrap_or(taxid);
        self.parents.contains_key(&current).then_some(current)
    }

    /// Root-to-taxon path, `None` if the walk leaves the taxonomy or cycles.
    fn lineage(&self, taxid: TaxId) -> Option<Vec<TaxId>> {
        let mut path = vec![taxid];
        let mut current = taxid;
        while path.len() <= MAX_LINEAGE_DEPTH {
            let parent = *self.parents.get(&current)?;
            if parent == current {
                path.reverse();
                return Some(path);
            }
            path.push(parent);
            current = parent;
        }
        None
    }
}

impl TaxonomyGateway for TaxdumpGateway {
    fn build_tree(&self, taxa: &BTreeSet<TaxId>) -> Result<Tree> {
        let mut requested = BTreeSet::new();
        let mut lineages = Vec::with_capacity(taxa.len());

        for &taxid in taxa {
            let Some(current) = self.resolve(taxid) else {
                warn!("Taxid {} not found in taxonomy", taxid);
                continue;
            };
            if current != taxid {
                debug!("Taxid {} merged into {}", taxid, current);
            }
            match self.lineage(current) {
                Some(lineage) => {
                    requested.insert(current);
                    lineages.push(lineage);
                }
                None => warn!("Taxid {} has a broken lineage", current),
            }
        }

        Ok(induced_topology(&requested, &lineages))
    }

    fn first_descendants(&self, parents: &BTreeSet<TaxId>) -> Result<BTreeMap<TaxId, TaxId>> {
        Ok(parents
            .iter()
            .filter_map(|parent| {
                let first = self.children.get(parent)?.iter().min()?;
                Some((*parent, *first))
            })
            .collect())
    }
}

/// Minimal tree spanning the given lineages.
///
/// Unrequested nodes with a single child are collapsed, so the root is the
/// lowest common ancestor and internal nodes are either branch points or
/// requested taxa. A requested taxon with requested descendants stays
/// internal and is therefore not a leaf.
fn induced_topology(requested: &BTreeSet<TaxId>, lineages: &[Vec<TaxId>]) -> Tree {
    let mut union: BTreeMap<TaxId, BTreeSet<TaxId>> = BTreeMap::new();
    let mut roots = BTreeSet::new();

    for lineage in lineages {
        if let Some(first) = lineage.first() {
            roots.insert(*first);
            union.entry(*first).or_default();
        }
        for pair in lineage.windows(2) {
            union.entry(pair[0]).or_default().insert(pair[1]);
            union.entry(pair[1]).or_default();
        }
    }

    // Follow unrequested single-child chains down to the next kept node.
    let descend = |mut taxid: TaxId| -> TaxId {
        while !requested.contains(&taxid) {
            let only_child = union
                .get(&taxid)
                .filter(|kids| kids.len() == 1)
                .and_then(|kids| kids.iter().next());
            match only_child {
                Some(&kid) => taxid = kid,
                None => break,
            }
        }
        taxid
    };

    let tops: Vec<TaxId> = roots.iter().map(|&root| descend(root)).collect();
    let (mut tree, mut stack) = match tops.as_slice() {
        [] => return Tree::empty(),
        [single] => (Tree::new(single.to_string()), vec![(0usize, *single)]),
        // Disconnected taxonomies hang off an unnamed root.
        many => {
            let mut tree = Tree::new("");
            let stack: Vec<(usize, TaxId)> = many
                .iter()
                .map(|&top| (tree.add_child(0, top.to_string()), top))
                .collect();
            (tree, stack)
        }
    };

    while let Some((idx, taxid)) = stack.pop() {
        let Some(kids) = union.get(&taxid) else {
            continue;
        };
        for &kid in kids {
            let kept = descend(kid);
            let child_idx = tree.add_child(idx, kept.to_string());
            stack.push((child_idx, kept));
        }
    }

    tree
}

/// Reads the first two `\t|\t`-separated integer fields of a `.dmp` file.
/// Lines that do not parse are skipped.
fn read_dmp_pairs(path: &Path) -> Result<Vec<(TaxId, TaxId)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut pairs = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split("\t|");
        let (Some(first), Some(second)) = (fields.next(), fields.next()) else {
            continue;
        };
        match (first.parse::<TaxId>(), second.parse::<TaxId>()) {
            (Ok(a), Ok(b)) => pairs.push((a, b)),
            _ => continue,
        }
    }

    Ok(pairs)
}

// ============================================================================
// Taxdump Download
// ============================================================================

/// Downloads the NCBI taxdump archive into `taxonomy_dir` and unpacks it.
pub fn update_taxdump(taxonomy_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(taxonomy_dir)?;
    let tar_path = taxonomy_dir.join("taxdump.tar.gz");

    info!("Downloading NCBI taxdump (~60MB) into {}", taxonomy_dir.display());
    download_file(NCBI_TAXDUMP_URL, &tar_path)?;

    info!("Extracting taxdump...");
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(&tar_path)?));
    archive.unpack(taxonomy_dir)?;

    std::fs::remove_file(&tar_path).ok();
    Ok(())
}

fn download_file(url: &str, output_path: &Path) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..3 {
        match download_file_once(url, output_path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Download failed (attempt {}): {}", attempt + 1, e);
                last_error = Some(e);
                if attempt < 2 {
                    std::thread::sleep(Duration::from_secs(5));
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| PipelineError::taxonomy(format!("failed to download {}", url))))
}

fn download_file_once(url: &str, output_path: &Path) -> Result<()> {
    let response = ureq::get(url)
        .timeout(Duration::from_secs(1800))
        .call()
        .map_err(|e| PipelineError::taxonomy(format!("failed to download {}: {}", url, e)))?;

    let mut file = File::create(output_path)?;
    let mut reader = response.into_reader();
    std::io::copy(&mut reader, &mut file)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
