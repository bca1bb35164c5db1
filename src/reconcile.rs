//! Tree Reconciler Module
//!
//! Makes a taxonomy tree and a dataset agree on their taxa. Taxa the tree
//! cannot place as leaves are replaced by their smallest child taxid and the
//! tree is rebuilt, for a bounded number of rounds.
//!
//! # State Machine
//! ```text
//! Init -> Built -> Validated -+-> Done                (nothing missing)
//!           ^                 +-> Failed              (rounds exhausted)
//!           |                 +-> Substituted -+
//!           +----------------------------------+
//! ```
//! With the default budget of two retries the tree is built at most three
//! times.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::taxonomy::{TaxId, TaxonomyGateway};
use crate::tree::Tree;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Substitution rounds allowed after the initial tree.
    pub max_retries: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

// ============================================================================
// Remapping
// ============================================================================

/// Original taxid → taxid used in the final tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remapping {
    map: BTreeMap<TaxId, TaxId>,
}

impl Remapping {
    pub fn identity(taxa: &BTreeSet<TaxId>) -> Self {
        Self {
            map: taxa.iter().map(|&t| (t, t)).collect(),
        }
    }

    /// Final taxid for `original`; unknown ids map to themselves.
    pub fn apply(&self, original: TaxId) -> TaxId {
        self.map.get(&original).copied().unwrap_or(original)
    }

    /// Advances every entry whose current value was substituted this round.
    fn compose(&mut self, substitutions: &BTreeMap<TaxId, TaxId>) {
        for current in self.map.values_mut() {
            if let Some(&next) = substitutions.get(current) {
                *current = next;
            }
        }
    }

    /// Entries whose final taxid differs from the original.
    pub fn substituted(&self) -> impl Iterator<Item = (TaxId, TaxId)> + '_ {
        self.map
            .iter()
            .filter(|(from, to)| from != to)
            .map(|(&from, &to)| (from, to))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaxId, TaxId)> + '_ {
        self.map.iter().map(|(&from, &to)| (from, to))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// Round Snapshots
// ============================================================================

/// Immutable record of one tree construction and its validation.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round: usize,
    pub working: BTreeSet<TaxId>,
    /// Requested taxa that are not leaves of the tree.
    pub missing: BTreeSet<TaxId>,
    /// Leaves of the tree that were never requested.
    pub extra: BTreeSet<String>,
}

/// Successful reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Final tree, already ultrametric.
    pub tree: Tree,
    pub remapping: Remapping,
    pub rounds: Vec<RoundReport>,
}

impl Reconciliation {
    /// Number of tree constructions performed.
    pub fn builds(&self) -> usize {
        self.rounds.len()
    }
}

enum State {
    Init,
    Built {
        round: usize,
        working: BTreeSet<TaxId>,
        tree: Tree,
    },
    Validated {
        tree: Tree,
        report: RoundReport,
    },
    Substituted {
        round: usize,
        working: BTreeSet<TaxId>,
    },
}

/// Compares a tree's leaves with the working set.
pub fn validate_tree(tree: &Tree, working: &BTreeSet<TaxId>) -> (BTreeSet<TaxId>, BTreeSet<String>) {
    let leaves = tree.leaf_names();
    let missing: BTreeSet<TaxId> = working
        .iter()
        .filter(|t| !leaves.contains(&t.to_string()))
        .copied()
        .collect();
    let requested: BTreeSet<String> = working.iter().map(|t| t.to_string()).collect();
    let extra: BTreeSet<String> = leaves.difference(&requested).cloned().collect();

    if !missing.is_empty() {
        warn!("Taxa missing in tree: {}", join(&missing));
    }
    if !extra.is_empty() {
        error!("Extra taxa in tree: {}", join(&extra));
    }
    (missing, extra)
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct Reconciler<'a, G: TaxonomyGateway> {
    gateway: &'a G,
    config: ReconcileConfig,
}

impl<'a, G: TaxonomyGateway> Reconciler<'a, G> {
    pub fn new(gateway: &'a G, config: ReconcileConfig) -> Self {
        Self { gateway, config }
    }

    /// Builds a tree whose leaf set equals the (possibly substituted) taxa.
    ///
    /// # Errors
    /// `PipelineError::Exhausted` when taxa are still missing after
    /// `max_retries` substitution rounds; gateway errors are propagated.
    pub fn reconcile(&self, taxa: &BTreeSet<TaxId>) -> Result<Reconciliation> {
        let mut remapping = Remapping::identity(taxa);
        let mut rounds: Vec<RoundReport> = Vec::new();
        let mut state = State::Init;

        loop {
            state = match state {
                State::Init => {
                    info!("Creating tree for {} taxa", taxa.len());
                    State::Built {
                        round: 0,
                        working: taxa.clone(),
                        tree: self.gateway.build_tree(taxa)?,
                    }
                }

                State::Built { round, working, tree } => {
                    debug!(round, leaves = tree.leaf_names().len(), "Validating tree");
                    let (missing, extra) = validate_tree(&tree, &working);
                    State::Validated {
                        tree,
                        report: RoundReport {
                            round,
                            working,
                            missing,
                            extra,
                        },
                    }
                }

                State::Validated { tree, report } if report.missing.is_empty() => {
                    match report.round {
                        0 => info!("Tree validation successful: all taxa match"),
                        n => info!("All missing taxa replaced after {} substitution round(s)", n),
                    }
                    rounds.push(report);
                    return Ok(Reconciliation {
                        tree: self.gateway.ultrametricize(tree),
                        remapping,
                        rounds,
                    });
                }

                State::Validated { report, .. } if report.round >= self.config.max_retries => {
                    error!(
                        "Taxa still missing after {} substitution round(s), giving up",
                        report.round
                    );
                    let missing = report.missing.iter().copied().collect();
                    let round = report.round;
                    rounds.push(report);
                    return Err(PipelineError::Exhausted {
                        rounds: round,
                        missing,
                    });
                }

                State::Validated { report, .. } => {
                    let round = report.round + 1;
                    info!(round, "Replacing {} missing taxa with first descendant", report.missing.len());

                    let substitutions = self.gateway.first_descendants(&report.missing)?;
                    for parent in report.missing.iter().filter(|t| !substitutions.contains_key(t)) {
                        debug!("No descendant found for {}", parent);
                    }

                    let working = substitute(&report.working, &substitutions);
                    remapping.compose(&substitutions);
                    rounds.push(report);
                    State::Substituted { round, working }
                }

                State::Substituted { round, working } => {
                    let tree = self.gateway.build_tree(&working)?;
                    State::Built { round, working, tree }
                }
            };
        }
    }
}

/// Replaces every taxid that has a substitution; others are kept.
fn substitute(working: &BTreeSet<TaxId>, substitutions: &BTreeMap<TaxId, TaxId>) -> BTreeSet<TaxId> {
    working
        .iter()
        .map(|t| substitutions.get(t).copied().unwrap_or(*t))
        .collect()
}

fn join<T: ToString>(items: &BTreeSet<T>) -> String {
    items.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::TaxdumpGateway;
    use std::cell::Cell;

    fn ids(values: &[u32]) -> BTreeSet<TaxId> {
        values.iter().map(|&v| TaxId(v)).collect()
    }

    /// 1 -> 2 -> {10 -> {100 -> {105, 102, 110}, 11}, 20 -> {21, 22}}
    fn taxonomy() -> TaxdumpGateway {
        let edges = [
            (1, 1),
            (2, 1),
            (10, 2),
            (20, 2),
            (11, 10),
            (100, 10),
            (105, 100),
            (102, 100),
            (110, 100),
            (21, 20),
            (22, 20),
        ];
        TaxdumpGateway::from_parents(edges.iter().map(|&(c, p)| (TaxId(c), TaxId(p))))
    }

    /// Always builds a tree whose only leaf is 7; every taxon's descendant is
    /// `taxon * 10`, which the tree never contains either.
    struct EndlessGateway {
        builds: Cell<usize>,
    }

    impl TaxonomyGateway for EndlessGateway {
        fn build_tree(&self, _taxa: &BTreeSet<TaxId>) -> Result<Tree> {
            self.builds.set(self.builds.get() + 1);
            let mut tree = Tree::new("1");
            tree.add_child(0, "7");
            Ok(tree)
        }

        fn first_descendants(&self, parents: &BTreeSet<TaxId>) -> Result<BTreeMap<TaxId, TaxId>> {
            Ok(parents.iter().map(|&p| (p, TaxId(p.0 * 10))).collect())
        }
    }

    #[test]
    fn test_consistent_set_is_identity() {
        let tax = taxonomy();
        let taxa = ids(&[11, 102, 21]);
        let result = Reconciler::new(&tax, ReconcileConfig::default())
            .reconcile(&taxa)
            .unwrap();

        assert_eq!(result.builds(), 1);
        assert_eq!(result.remapping, Remapping::identity(&taxa));
        assert_eq!(result.remapping.substituted().count(), 0);
        let expected: BTreeSet<String> = taxa.iter().map(|t| t.to_string()).collect();
        assert_eq!(result.tree.leaf_names(), expected);
        assert!(result.tree.is_ultrametric(1e-9));
    }

    #[test]
    fn test_internal_taxon_replaced_by_min_child() {
        let tax = taxonomy();
        // 100 is an ancestor of 105, so it cannot be a leaf
        let taxa = ids(&[100, 105, 21]);
        let result = Reconciler::new(&tax, ReconcileConfig::default())
            .reconcile(&taxa)
            .unwrap();

        assert_eq!(result.builds(), 2);
        assert_eq!(result.remapping.apply(TaxId(100)), TaxId(102));
        assert_eq!(result.remapping.apply(TaxId(105)), TaxId(105));
        assert!(result.tree.leaf_names().contains("102"));
        assert_eq!(result.rounds[0].missing, ids(&[100]));
        assert!(result.rounds[1].missing.is_empty());
    }

    #[test]
    fn test_two_round_substitution_composes() {
        // 2 is an ancestor of 11; its first child 10 is an ancestor of 11 too
        let tax = taxonomy();
        let taxa = ids(&[2, 11]);
        let result = Reconciler::new(&tax, ReconcileConfig::default())
            .reconcile(&taxa)
            .unwrap();

        assert_eq!(result.builds(), 3);
        // 2 -> 10 -> 11 (min child of 10)
        assert_eq!(result.remapping.apply(TaxId(2)), TaxId(11));
        assert_eq!(result.tree.leaf_names().len(), 1);
    }

    #[test]
    fn test_retry_budget_respected() {
        let gateway = EndlessGateway { builds: Cell::new(0) };
        let err = Reconciler::new(&gateway, ReconcileConfig::default())
            .reconcile(&ids(&[3, 5]))
            .err()
            .unwrap();

        assert_eq!(gateway.builds.get(), 3, "initial build plus two retries");
        match err {
            PipelineError::Exhausted { rounds, missing } => {
                assert_eq!(rounds, 2);
                assert_eq!(missing, vec![TaxId(300), TaxId(500)]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_zero_retries_fails_on_first_mismatch() {
        let gateway = EndlessGateway { builds: Cell::new(0) };
        let config = ReconcileConfig { max_retries: 0 };
        assert!(Reconciler::new(&gateway, config).reconcile(&ids(&[3])).is_err());
        assert_eq!(gateway.builds.get(), 1);
    }

    #[test]
    fn test_unresolvable_taxon_kept_then_fails() {
        let tax = taxonomy();
        // 9999 is unknown: no tree leaf, no descendants
        let err = Reconciler::new(&tax, ReconcileConfig::default())
            .reconcile(&ids(&[9999, 21]))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Exhausted { .. }));
    }

    #[test]
    fn test_extra_leaves_are_not_fatal() {
        // 555 was merged into 22: the tree shows 22, which was never requested
        let tax = taxonomy().with_merged([(TaxId(555), TaxId(22))]);
        let err = Reconciler::new(&tax, ReconcileConfig::default())
            .reconcile(&ids(&[555, 21]))
            .err()
            .unwrap();
        // 555 itself never becomes a leaf, so the run still fails on missing
        assert!(matches!(err, PipelineError::Exhausted { .. }));

        let (missing, extra) = validate_tree(&tax.build_tree(&ids(&[555, 21])).unwrap(), &ids(&[21, 555]));
        assert_eq!(missing, ids(&[555]));
        assert!(extra.contains("22"));
    }

    #[test]
    fn test_validate_tree_reports_extra_only() {
        let mut tree = Tree::new("1");
        tree.add_child(0, "21");
        tree.add_child(0, "22");
        let (missing, extra) = validate_tree(&tree, &ids(&[21]));
        assert!(missing.is_empty());
        assert_eq!(extra.into_iter().collect::<Vec<_>>(), vec!["22".to_string()]);
    }

    #[test]
    fn test_remapping_compose() {
        let mut remap = Remapping::identity(&ids(&[1, 2, 3]));
        remap.compose(&BTreeMap::from([(TaxId(1), TaxId(10))]));
        remap.compose(&BTreeMap::from([(TaxId(10), TaxId(100)), (TaxId(3), TaxId(30))]));
        assert_eq!(remap.apply(TaxId(1)), TaxId(100));
        assert_eq!(remap.apply(TaxId(2)), TaxId(2));
        assert_eq!(remap.apply(TaxId(3)), TaxId(30));
        assert_eq!(remap.substituted().count(), 2);
    }
}
