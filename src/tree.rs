//! Phylogenetic Tree Module
//!
//! Arena-backed tree structure shared by gene trees and the consensus
//! tree. Nodes are records addressed by index, so leaf pruning and
//! degree-2 collapse during topology restriction are index rewrites
//! rather than pointer surgery.
//!
//! # Capabilities
//! - Newick parsing (labels, branch lengths, internal support labels)
//! - Newick serialization
//! - Topology restriction to a leaf subset (with degree-2 collapse)
//! - Non-trivial bipartition extraction (unrooted split semantics)
//! - Patristic leaf-to-leaf distances

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

// ============================================================================
// Arena Nodes
// ============================================================================

/// A single tree node record.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Parent index; None for the root.
    pub parent: Option<usize>,
    /// Child indices, in serialization order.
    pub children: Vec<usize>,
    /// Leaf name, or internal support label from the tree tool.
    pub label: Option<String>,
    /// Length of the branch above this node (0.0 at the root).
    pub branch_length: f64,
}

/// A rooted-representation tree with unrooted split semantics.
#[derive(Debug, Clone)]
pub struct Tree {
    /// Node arena; indices are stable for the life of the tree.
    pub nodes: Vec<TreeNode>,
    /// Index of the root node.
    pub root: usize,
}

impl Tree {
    /// Indices of all leaf nodes, in serialization order.
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].children.is_empty() && self.reachable(i))
            .collect()
    }

    /// Labels of all leaves, in serialization order.
    pub fn leaf_labels(&self) -> Vec<String> {
        self.leaves()
            .iter()
            .map(|&i| self.nodes[i].label.clone().unwrap_or_default())
            .collect()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    // Restriction rebuilds arenas, so all nodes in a fresh tree are live;
    // reachability guards against any future in-place edits.
    fn reachable(&self, mut node: usize) -> bool {
        let mut hops = 0;
        while let Some(parent) = self.nodes[node].parent {
            node = parent;
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
        }
        node == self.root
    }

    // ------------------------------------------------------------------
    // Newick parsing
    // ------------------------------------------------------------------

    /// Parses a Newick string into an arena tree.
    ///
    /// Accepts leaf and internal labels, branch lengths (plain or
    /// scientific notation), and arbitrary whitespace. The trailing
    /// semicolon is optional.
    pub fn parse_newick(text: &str) -> Result<Tree> {
        let bytes: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        if bytes.is_empty() {
            anyhow::bail!("Empty Newick input");
        }

        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut pos = 0usize;
        let root = parse_subtree(&bytes, &mut pos, &mut nodes, None)?;

        if pos < bytes.len() && bytes[pos] == ';' {
            pos += 1;
        }
        if pos != bytes.len() {
            anyhow::bail!("Trailing characters after Newick tree at offset {}", pos);
        }

        Ok(Tree { nodes, root })
    }

    // ------------------------------------------------------------------
    // Newick serialization
    // ------------------------------------------------------------------

    /// Serializes the tree back to Newick (with branch lengths).
    pub fn to_newick(&self) -> String {
        let mut out = String::new();
        self.write_node(self.root, true, &mut out);
        out.push(';');
        out
    }

    fn write_node(&self, node: usize, is_root: bool, out: &mut String) {
        let n = &self.nodes[node];
        if !n.children.is_empty() {
            out.push('(');
            for (i, &child) in n.children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_node(child, false, out);
            }
            out.push(')');
        }
        if let Some(label) = &n.label {
            out.push_str(label);
        }
        if !is_root {
            out.push(':');
            out.push_str(&format_branch(n.branch_length));
        }
    }

    // ------------------------------------------------------------------
    // Restriction
    // ------------------------------------------------------------------

    /// Restricts the tree to the leaves named in `keep` by topology
    /// induction: unnamed leaves are dropped, degree-2 internal nodes
    /// are collapsed (branch lengths summed), and a binary root left
    /// behind by the pruning is spliced away.
    ///
    /// # Errors
    /// Fails if no kept leaf is present in the tree.
    pub fn restrict(&self, keep: &FxHashSet<String>) -> Result<Tree> {
        let mut nodes: Vec<TreeNode> = Vec::new();
        let root = match self.copy_restricted(self.root, keep, &mut nodes) {
            Some(idx) => idx,
            None => anyhow::bail!("Restriction removed every leaf"),
        };

        let mut tree = Tree { nodes, root };
        tree.nodes[root].parent = None;
        tree.nodes[root].branch_length = 0.0;
        tree.suppress_binary_root();
        Ok(tree)
    }

    /// Recursively copies the subtree at `node`, keeping only wanted
    /// leaves. Returns the new-arena index, or None if nothing survives.
    fn copy_restricted(
        &self,
        node: usize,
        keep: &FxHashSet<String>,
        arena: &mut Vec<TreeNode>,
    ) -> Option<usize> {
        let n = &self.nodes[node];

        if n.children.is_empty() {
            let label = n.label.as_deref().unwrap_or("");
            if !keep.contains(label) {
                return None;
            }
            arena.push(TreeNode {
                parent: None,
                children: Vec::new(),
                label: n.label.clone(),
                branch_length: n.branch_length,
            });
            return Some(arena.len() - 1);
        }

        let kept: Vec<usize> = n
            .children
            .iter()
            .filter_map(|&c| self.copy_restricted(c, keep, arena))
            .collect();

        match kept.len() {
            0 => None,
            1 => {
                // Degree-2 collapse: absorb this node's branch into the child
                let child = kept[0];
                arena[child].branch_length += n.branch_length;
                Some(child)
            }
            _ => {
                arena.push(TreeNode {
                    parent: None,
                    children: kept.clone(),
                    label: None,
                    branch_length: n.branch_length,
                });
                let idx = arena.len() - 1;
                for &c in &kept {
                    arena[c].parent = Some(idx);
                }
                Some(idx)
            }
        }
    }

    /// Splices a root with exactly two children when either child is
    /// internal, yielding the conventional unrooted (multifurcating)
    /// root representation.
    fn suppress_binary_root(&mut self) {
        loop {
            let root_children = self.nodes[self.root].children.clone();
            if root_children.len() != 2 {
                return;
            }
            let internal = root_children
                .iter()
                .copied()
                .find(|&c| !self.nodes[c].children.is_empty());
            let splice = match internal {
                Some(c) => c,
                None => return, // two-leaf tree
            };
            let other: usize = root_children
                .iter()
                .copied()
                .find(|&c| c != splice)
                .unwrap();

            let spliced_length = self.nodes[splice].branch_length;
            let grandchildren = self.nodes[splice].children.clone();

            self.nodes[other].branch_length += spliced_length;
            let new_children: Vec<usize> = std::iter::once(other)
                .chain(grandchildren.iter().copied())
                .collect();
            for &g in &grandchildren {
                self.nodes[g].parent = Some(self.root);
            }
            self.nodes[splice].children.clear();
            self.nodes[splice].parent = None;
            self.nodes[splice].label = None;
            self.nodes[self.root].children = new_children;
        }
    }

    // ------------------------------------------------------------------
    // Bipartitions
    // ------------------------------------------------------------------

    /// Non-trivial bipartitions under unrooted split semantics.
    ///
    /// Each split is normalized to the side *not* containing the
    /// lexicographically smallest leaf, sorted. Trees with fewer than
    /// four leaves carry no non-trivial splits and return an empty set.
    pub fn bipartitions(&self) -> FxHashSet<Vec<String>> {
        let mut splits = FxHashSet::default();
        let labels = self.leaf_labels();
        let n = labels.len();
        if n < 4 {
            return splits;
        }
        let reference = labels.iter().min().cloned().unwrap();
        let all: FxHashSet<String> = labels.into_iter().collect();

        for idx in 0..self.nodes.len() {
            if idx == self.root || self.nodes[idx].children.is_empty() {
                continue;
            }
            if !self.reachable(idx) {
                continue;
            }
            let mut side: Vec<String> = Vec::new();
            self.collect_leaf_labels(idx, &mut side);

            let mut side: Vec<String> = if side.contains(&reference) {
                all.iter().filter(|l| !side.contains(l)).cloned().collect()
            } else {
                side
            };
            side.sort();

            if side.len() >= 2 && side.len() <= n - 2 {
                splits.insert(side);
            }
        }

        splits
    }

    fn collect_leaf_labels(&self, node: usize, out: &mut Vec<String>) {
        let n = &self.nodes[node];
        if n.children.is_empty() {
            out.push(n.label.clone().unwrap_or_default());
            return;
        }
        for &c in &n.children {
            self.collect_leaf_labels(c, out);
        }
    }

    // ------------------------------------------------------------------
    // Patristic distances
    // ------------------------------------------------------------------

    /// Pairwise patristic distances between leaves, keyed by the sorted
    /// label pair. Duplicate labels (paralog leaves) collapse to the
    /// minimum observed distance.
    pub fn leaf_distance_map(&self) -> FxHashMap<(String, String), f64> {
        let leaves = self.leaves();
        let mut map: FxHashMap<(String, String), f64> = FxHashMap::default();

        for (i, &la) in leaves.iter().enumerate() {
            // Cumulative distance from la up to each ancestor
            let mut up_a: FxHashMap<usize, f64> = FxHashMap::default();
            let mut cur = la;
            let mut dist = 0.0;
            up_a.insert(cur, 0.0);
            while let Some(parent) = self.nodes[cur].parent {
                dist += self.nodes[cur].branch_length;
                up_a.insert(parent, dist);
                cur = parent;
            }

            for &lb in leaves.iter().skip(i + 1) {
                let mut cur = lb;
                let mut dist_b = 0.0;
                let total = loop {
                    if let Some(&d) = up_a.get(&cur) {
                        break d + dist_b;
                    }
                    match self.nodes[cur].parent {
                        Some(parent) => {
                            dist_b += self.nodes[cur].branch_length;
                            cur = parent;
                        }
                        None => break f64::INFINITY,
                    }
                };

                let name_a = self.nodes[la].label.clone().unwrap_or_default();
                let name_b = self.nodes[lb].label.clone().unwrap_or_default();
                let key = if name_a <= name_b {
                    (name_a, name_b)
                } else {
                    (name_b, name_a)
                };
                map.entry(key)
                    .and_modify(|d| {
                        if total < *d {
                            *d = total;
                        }
                    })
                    .or_insert(total);
            }
        }

        map
    }
}

// ============================================================================
// Parsing Internals
// ============================================================================

fn parse_subtree(
    chars: &[char],
    pos: &mut usize,
    nodes: &mut Vec<TreeNode>,
    parent: Option<usize>,
) -> Result<usize> {
    let idx = nodes.len();
    nodes.push(TreeNode {
        parent,
        children: Vec::new(),
        label: None,
        branch_length: 0.0,
    });

    if *pos < chars.len() && chars[*pos] == '(' {
        *pos += 1;
        loop {
            let child = parse_subtree(chars, pos, nodes, Some(idx))?;
            nodes[idx].children.push(child);
            match chars.get(*pos) {
                Some(',') => {
                    *pos += 1;
                }
                Some(')') => {
                    *pos += 1;
                    break;
                }
                other => anyhow::bail!(
                    "Malformed Newick: expected ',' or ')', found {:?}",
                    other
                ),
            }
        }
    }

    // Label (leaf name or internal support value)
    let start = *pos;
    while let Some(&c) = chars.get(*pos) {
        if c == ':' || c == ',' || c == ')' || c == '(' || c == ';' {
            break;
        }
        *pos += 1;
    }
    if *pos > start {
        nodes[idx].label = Some(chars[start..*pos].iter().collect());
    }

    // Branch length
    if chars.get(*pos) == Some(&':') {
        *pos += 1;
        let start = *pos;
        while let Some(&c) = chars.get(*pos) {
            if c == ',' || c == ')' || c == ';' || c == '(' {
                break;
            }
            *pos += 1;
        }
        let text: String = chars[start..*pos].iter().collect();
        nodes[idx].branch_length = text
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid branch length: {}", text))?;
    }

    if nodes[idx].children.is_empty() && nodes[idx].label.is_none() {
        anyhow::bail!("Malformed Newick: leaf without a name");
    }

    Ok(idx)
}

fn format_branch(length: f64) -> String {
    if length == length.trunc() && length.abs() < 1e15 {
        format!("{:.1}", length)
    } else {
        format!("{}", length)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keep(names: &[&str]) -> FxHashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_and_serialize() {
        let t = Tree::parse_newick("((a:0.1,b:0.2)0.95:0.3,c:0.4,d:0.5);").unwrap();
        assert_eq!(t.leaf_count(), 4);
        assert_eq!(t.leaf_labels(), vec!["a", "b", "c", "d"]);

        let out = t.to_newick();
        let reparsed = Tree::parse_newick(&out).unwrap();
        assert_eq!(reparsed.leaf_labels(), t.leaf_labels());
        assert_eq!(reparsed.bipartitions(), t.bipartitions());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Tree::parse_newick("((a,b)").is_err());
        assert!(Tree::parse_newick("(a,b);extra").is_err());
        assert!(Tree::parse_newick("(a:x,b:0.1);").is_err());
    }

    #[test]
    fn test_restriction_leaf_count_and_no_degree2() {
        let t = Tree::parse_newick("(((a:1.0,b:1.0):1.0,(c:1.0,d:1.0):1.0):1.0,(e:1.0,f:1.0):1.0);")
            .unwrap();
        let r = t.restrict(&keep(&["a", "c", "e"])).unwrap();

        assert_eq!(r.leaf_count(), 3);
        // No internal node (root aside) may have exactly one child
        for (idx, node) in r.nodes.iter().enumerate() {
            if !node.children.is_empty() && r.reachable(idx) {
                assert!(node.children.len() >= 2, "degree-2 node survived restriction");
            }
        }
    }

    #[test]
    fn test_restriction_sums_collapsed_branches() {
        let t = Tree::parse_newick("((a:1.0,b:2.0):3.0,c:1.0,d:1.0);").unwrap();
        let r = t.restrict(&keep(&["a", "c", "d"])).unwrap();

        // b was pruned; a's path absorbs the collapsed internal branch
        let dists = r.leaf_distance_map();
        assert_eq!(dists[&("a".to_string(), "c".to_string())], 5.0);
    }

    #[test]
    fn test_binary_root_suppressed() {
        let t = Tree::parse_newick("((a:1.0,b:1.0):0.5,(c:1.0,(d:1.0,e:1.0):1.0):0.5);").unwrap();
        let r = t.restrict(&keep(&["a", "b", "c", "d", "e"])).unwrap();
        assert!(r.nodes[r.root].children.len() >= 3);
        assert_eq!(r.leaf_count(), 5);
        // Distances across the old root edge are preserved
        let d = r.leaf_distance_map();
        assert_eq!(d[&("a".to_string(), "c".to_string())], 3.0);
    }

    #[test]
    fn test_bipartitions_five_leaf_caterpillar() {
        let t = Tree::parse_newick("(((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0,e:1.0);").unwrap();
        let splits = t.bipartitions();

        // Non-trivial splits: {a,b} and {a,b,c} (normalized away from 'a':
        // {a,b} -> complement {c,d,e}; {a,b,c} -> {d,e})
        let expected: FxHashSet<Vec<String>> = [
            vec!["c".to_string(), "d".to_string(), "e".to_string()],
            vec!["d".to_string(), "e".to_string()],
        ]
        .into_iter()
        .collect();
        assert_eq!(splits, expected);
    }

    #[test]
    fn test_small_trees_have_no_bipartitions() {
        let t = Tree::parse_newick("(a:1.0,b:1.0,c:1.0);").unwrap();
        assert!(t.bipartitions().is_empty());
    }

    #[test]
    fn test_leaf_distances() {
        let t = Tree::parse_newick("((a:1.0,b:2.0):0.5,c:3.0);").unwrap();
        let d = t.leaf_distance_map();
        assert_eq!(d[&("a".to_string(), "b".to_string())], 3.0);
        assert_eq!(d[&("a".to_string(), "c".to_string())], 4.5);
        assert_eq!(d[&("b".to_string(), "c".to_string())], 5.5);
    }

    #[test]
    fn test_duplicate_leaf_takes_min_distance() {
        // Paralog leaves share the label "g1"
        let t = Tree::parse_newick("((g1:1.0,g2:1.0):1.0,g1:5.0,g3:1.0);").unwrap();
        let d = t.leaf_distance_map();
        // g1-g2 pairs: near copy at 2.0, far copy at 7.0; min wins
        assert_eq!(d[&("g1".to_string(), "g2".to_string())], 2.0);
    }
}
