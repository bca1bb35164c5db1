//! Rooted Tree Module
//!
//! Arena-backed rooted tree used for the taxonomy topology handed to the
//! model runner. Nodes carry a name (a taxid for taxonomy trees) and a branch
//! length to their parent.
//!
//! # Newick Output
//! Trees are written with internal node names and branch lengths:
//! ```text
//! (9606:1,10090:1)314146;
//! ```
//! The root carries no branch length.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

// ============================================================================
// Node
// ============================================================================

/// A single tree node stored in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node label (taxid for taxonomy topologies).
    pub name: String,
    /// Index of the parent node, `None` for the root.
    pub parent: Option<usize>,
    /// Child indices, always greater than this node's own index.
    pub children: Vec<usize>,
    /// Branch length to the parent.
    pub dist: f64,
}

// ============================================================================
// Tree
// ============================================================================

/// Rooted tree. The root, when present, is always node 0.
///
/// Children are appended after their parent, so a reverse scan of the arena
/// visits every child before its parent.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Creates a tree holding only a root.
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node {
                name: root_name.into(),
                parent: None,
                children: Vec::new(),
                dist: 0.0,
            }],
        }
    }

    /// Creates a tree with no nodes at all (no requested taxon was known).
    pub fn empty() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn root(&self) -> Option<usize> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    /// Appends a child under `parent` with unit branch length.
    pub fn add_child(&mut self, parent: usize, name: impl Into<String>) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: name.into(),
            parent: Some(parent),
            children: Vec::new(),
            dist: 1.0,
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn is_leaf(&self, idx: usize) -> bool {
        self.nodes[idx].children.is_empty()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.children.is_empty())
    }

    /// Names of all leaves. A single-node tree has its root as the only leaf.
    pub fn leaf_names(&self) -> BTreeSet<String> {
        self.leaves().map(|n| n.name.clone()).collect()
    }

    /// Maximum edge count from each node down to a descendant leaf.
    fn heights(&self) -> Vec<usize> {
        let mut heights = vec![0usize; self.nodes.len()];
        for idx in (0..self.nodes.len()).rev() {
            heights[idx] = self.nodes[idx]
                .children
                .iter()
                .map(|&c| heights[c] + 1)
                .max()
                .unwrap_or(0);
        }
        heights
    }

    /// Rescales branch lengths so every leaf sits at the same distance from
    /// the root (balanced strategy).
    ///
    /// A node's height is the longest edge path to one of its leaves; each
    /// branch spans the height difference between parent and child. Leaves
    /// thus all end at the root height.
    pub fn to_ultrametric(&mut self) {
        let heights = self.heights();
        for idx in 0..self.nodes.len() {
            self.nodes[idx].dist = match self.nodes[idx].parent {
                Some(p) => (heights[p] - heights[idx]) as f64,
                None => 0.0,
            };
        }
    }

    /// Sum of branch lengths from `idx` up to the root.
    pub fn root_distance(&self, idx: usize) -> f64 {
        let mut total = 0.0;
        let mut current = idx;
        while let Some(parent) = self.nodes[current].parent {
            total += self.nodes[current].dist;
            current = parent;
        }
        total
    }

    /// True if every leaf is within `tolerance` of the same root distance.
    pub fn is_ultrametric(&self, tolerance: f64) -> bool {
        let mut distances = (0..self.nodes.len())
            .filter(|&i| self.is_leaf(i))
            .map(|i| self.root_distance(i));
        let Some(first) = distances.next() else {
            return true;
        };
        distances.all(|d| (d - first).abs() <= tolerance)
    }

    /// Serializes to Newick with internal names and branch lengths.
    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root() {
            self.write_subtree(root, &mut out);
        }
        out.push(';');
        out
    }

    fn write_subtree(&self, idx: usize, out: &mut String) {
        let node = &self.nodes[idx];
        if !node.children.is_empty() {
            out.push('(');
            for (i, &child) in node.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_subtree(child, out);
            }
            out.push(')');
        }
        out.push_str(&quote_label(&node.name));
        if node.parent.is_some() {
            out.push(':');
            out.push_str(&node.dist.to_string());
        }
    }

    /// Writes the Newick string followed by a newline.
    pub fn write_newick(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", self.to_newick())?;
        writer.flush()?;
        Ok(())
    }
}

fn quote_label(name: &str) -> String {
    const RESERVED: &[char] = &['(', ')', '[', ']', ':', ';', ',', '\'', ' ', '\t'];
    if name.contains(RESERVED) {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// root -> (a, mid -> (b, c))
    fn uneven_tree() -> Tree {
        let mut tree = Tree::new("root");
        let root = tree.root().unwrap();
        tree.add_child(root, "a");
        let mid = tree.add_child(root, "mid");
        tree.add_child(mid, "b");
        tree.add_child(mid, "c");
        tree
    }

    #[test]
    fn test_leaf_names() {
        let tree = uneven_tree();
        let leaves: Vec<String> = tree.leaf_names().into_iter().collect();
        assert_eq!(leaves, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_single_node_tree_is_leaf() {
        let tree = Tree::new("9606");
        assert_eq!(tree.leaf_names().len(), 1);
        assert_eq!(tree.to_newick(), "9606;");
    }

    #[test]
    fn test_to_ultrametric_balances_uneven_depths() {
        let mut tree = uneven_tree();
        assert!(!tree.is_ultrametric(1e-9));

        tree.to_ultrametric();
        assert!(tree.is_ultrametric(1e-9));
        assert_eq!(tree.node(1).dist, 2.0, "shallow leaf spans the full height");
    }

    #[test]
    fn test_newick_output() {
        let mut tree = uneven_tree();
        tree.to_ultrametric();
        assert_eq!(tree.to_newick(), "(a:2,(b:1,c:1)mid:1)root;");
    }

    #[test]
    fn test_quoted_labels() {
        let tree = Tree::new("Homo sapiens");
        assert_eq!(tree.to_newick(), "'Homo sapiens';");
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::empty();
        assert!(tree.leaf_names().is_empty());
        assert_eq!(tree.to_newick(), ";");
    }
}
