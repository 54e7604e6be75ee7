//! Consensus Tree Builder Module
//!
//! Summarizes the per-group gene trees into one reference topology over
//! genomes. Gene trees cover unequal, partially overlapping leaf sets,
//! so the consensus is built from averaged patristic distances: every
//! genome pair contributes the mean of its distances across the trees
//! that contain both genomes, and neighbor-joining turns the averaged
//! matrix into the consensus topology.
//!
//! When too few multi-genome trees exist, or some genome pair never
//! co-occurs in any tree, the builder falls back to a presence/absence
//! profile tree: Jaccard distances between the genomes' homolog-group
//! membership profiles, then the same neighbor-joining step.
//!
//! Both paths are deterministic for identical inputs in identical order.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use crate::error::PipelineError;
use crate::tree::{Tree, TreeNode};

// ============================================================================
// Capability Trait
// ============================================================================

/// Everything the consensus stage may draw on.
pub struct ConsensusInput<'a> {
    /// Genome-labeled gene trees from the per-group phase, ascending
    /// group id order.
    pub gene_trees: &'a [Tree],
    /// Genome -> homolog group ids (all groups, including ones dropped
    /// from tree building); drives the presence/absence fallback.
    pub membership: &'a FxHashMap<String, FxHashSet<u32>>,
}

/// Builds the reference consensus topology.
pub trait ConsensusBuilder {
    fn name(&self) -> &str;

    fn build(&self, input: &ConsensusInput) -> Result<Tree>;
}

// ============================================================================
// Distance Consensus (default)
// ============================================================================

/// Average-patristic-distance consensus with presence/absence fallback.
pub struct DistanceConsensus {
    /// Minimum number of gene trees before the averaged matrix is
    /// trusted over the presence/absence profile.
    pub min_trees: usize,
}

impl Default for DistanceConsensus {
    fn default() -> Self {
        Self { min_trees: 1 }
    }
}

impl ConsensusBuilder for DistanceConsensus {
    fn name(&self) -> &str {
        "distance-consensus"
    }

    fn build(&self, input: &ConsensusInput) -> Result<Tree> {
        if input.gene_trees.len() >= self.min_trees {
            if let Some((labels, matrix)) = average_distance_matrix(input.gene_trees) {
                return neighbor_joining(&labels, &matrix);
            }
        }
        presence_absence_tree(input.membership)
    }
}

/// Averages patristic distances across trees.
///
/// Returns None when any genome pair in the union never co-occurs in a
/// tree (incomplete matrix), which sends the caller to the fallback.
fn average_distance_matrix(trees: &[Tree]) -> Option<(Vec<String>, Vec<Vec<f64>>)> {
    let mut label_set: FxHashSet<String> = FxHashSet::default();
    for tree in trees {
        for label in tree.leaf_labels() {
            label_set.insert(label);
        }
    }
    let mut labels: Vec<String> = label_set.into_iter().collect();
    labels.sort();
    let n = labels.len();
    if n < 2 {
        return None;
    }

    let index: FxHashMap<&str, usize> = labels
        .iter()
        .enumerate()
        .map(|(i, l)| (l.as_str(), i))
        .collect();

    let mut sums = vec![vec![0.0f64; n]; n];
    let mut counts = vec![vec![0u32; n]; n];
    for tree in trees {
        for ((a, b), d) in tree.leaf_distance_map() {
            let (ia, ib) = (index[a.as_str()], index[b.as_str()]);
            sums[ia][ib] += d;
            sums[ib][ia] += d;
            counts[ia][ib] += 1;
            counts[ib][ia] += 1;
        }
    }

    let mut matrix = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if counts[i][j] == 0 {
                return None;
            }
            let avg = sums[i][j] / counts[i][j] as f64;
            matrix[i][j] = avg;
            matrix[j][i] = avg;
        }
    }

    Some((labels, matrix))
}

/// Builds the fallback tree from homolog-group membership profiles.
fn presence_absence_tree(
    membership: &FxHashMap<String, FxHashSet<u32>>,
) -> Result<Tree> {
    let mut labels: Vec<String> = membership.keys().cloned().collect();
    labels.sort();
    let n = labels.len();
    if n < 2 {
        return Err(PipelineError::InsufficientData(format!(
            "consensus needs at least 2 genomes, have {}",
            n
        ))
        .into());
    }

    let mut matrix = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let a = &membership[&labels[i]];
            let b = &membership[&labels[j]];
            let union = a.union(b).count();
            let d = if union == 0 {
                0.0
            } else {
                1.0 - a.intersection(b).count() as f64 / union as f64
            };
            matrix[i][j] = d;
            matrix[j][i] = d;
        }
    }

    neighbor_joining(&labels, &matrix)
}

// ============================================================================
// Neighbor-Joining
// ============================================================================

/// Neighbor-joining over a full distance matrix.
///
/// Ties in the Q criterion break toward the smallest (i, j) index pair,
/// so the topology is a pure function of the labeled matrix. Negative
/// branch-length estimates are clamped to zero.
pub fn neighbor_joining(labels: &[String], matrix: &[Vec<f64>]) -> Result<Tree> {
    let n = labels.len();
    if n < 2 {
        return Err(PipelineError::InsufficientData(
            "neighbor-joining needs at least 2 taxa".to_string(),
        )
        .into());
    }

    let mut nodes: Vec<TreeNode> = labels
        .iter()
        .map(|l| TreeNode {
            parent: None,
            children: Vec::new(),
            label: Some(l.clone()),
            branch_length: 0.0,
        })
        .collect();

    // active[i] = arena index; dist is parallel to active
    let mut active: Vec<usize> = (0..n).collect();
    let mut dist: Vec<Vec<f64>> = matrix.to_vec();

    while active.len() > 3 {
        let m = active.len();
        let row_sums: Vec<f64> = (0..m).map(|i| dist[i].iter().sum()).collect();

        // Minimize Q; ties toward the smallest (i, j)
        let mut best = (0usize, 1usize);
        let mut best_q = f64::INFINITY;
        for i in 0..m {
            for j in (i + 1)..m {
                let q = (m as f64 - 2.0) * dist[i][j] - row_sums[i] - row_sums[j];
                if q < best_q {
                    best_q = q;
                    best = (i, j);
                }
            }
        }
        let (i, j) = best;

        let dij = dist[i][j];
        let li = (dij / 2.0 + (row_sums[i] - row_sums[j]) / (2.0 * (m as f64 - 2.0))).max(0.0);
        let lj = (dij - li).max(0.0);

        let u = nodes.len();
        nodes.push(TreeNode {
            parent: None,
            children: vec![active[i], active[j]],
            label: None,
            branch_length: 0.0,
        });
        nodes[active[i]].parent = Some(u);
        nodes[active[i]].branch_length = li;
        nodes[active[j]].parent = Some(u);
        nodes[active[j]].branch_length = lj;

        // New distances to the joined node
        let mut new_row: Vec<f64> = Vec::with_capacity(m - 1);
        for k in 0..m {
            if k == i || k == j {
                continue;
            }
            new_row.push(((dist[i][k] + dist[j][k] - dij) / 2.0).max(0.0));
        }

        // Rebuild active/dist with u taking i's slot and j removed
        let keep_cols: Vec<usize> = (0..m).filter(|&k| k != i && k != j).collect();
        let kept_positions: Vec<usize> = (0..m).filter(|&k| k != j).collect();

        let next_active: Vec<usize> = kept_positions
            .iter()
            .map(|&k| if k == i { u } else { active[k] })
            .collect();

        let mut next_dist = vec![vec![0.0f64; m - 1]; m - 1];
        for (a_new, &a_old) in kept_positions.iter().enumerate() {
            for (b_new, &b_old) in kept_positions.iter().enumerate() {
                if a_new == b_new {
                    continue;
                }
                next_dist[a_new][b_new] = if a_old == i || b_old == i {
                    // Row/column of the freshly joined node
                    let other_old = if a_old == i { b_old } else { a_old };
                    let nr_idx = keep_cols.iter().position(|&c| c == other_old).unwrap();
                    new_row[nr_idx]
                } else {
                    dist[a_old][b_old]
                };
            }
        }

        active = next_active;
        dist = next_dist;
    }

    // Terminal join: 2 or 3 remaining nodes around the root
    let root = nodes.len();
    if active.len() == 3 {
        let (a, b, c) = (active[0], active[1], active[2]);
        let (dab, dac, dbc) = (dist[0][1], dist[0][2], dist[1][2]);
        let la = ((dab + dac - dbc) / 2.0).max(0.0);
        let lb = ((dab + dbc - dac) / 2.0).max(0.0);
        let lc = ((dac + dbc - dab) / 2.0).max(0.0);
        nodes.push(TreeNode {
            parent: None,
            children: vec![a, b, c],
            label: None,
            branch_length: 0.0,
        });
        for (node, length) in [(a, la), (b, lb), (c, lc)] {
            nodes[node].parent = Some(root);
            nodes[node].branch_length = length;
        }
    } else {
        let (a, b) = (active[0], active[1]);
        let half = (dist[0][1] / 2.0).max(0.0);
        nodes.push(TreeNode {
            parent: None,
            children: vec![a, b],
            label: None,
            branch_length: 0.0,
        });
        for node in [a, b] {
            nodes[node].parent = Some(root);
            nodes[node].branch_length = half;
        }
    }

    Ok(Tree { nodes, root })
}

// ============================================================================
// External Consensus (tool parity)
// ============================================================================

/// Shells out to an external consensus program: gene trees in (one
/// Newick per line), consensus Newick on stdout.
pub struct ExternalConsensus {
    /// Path to the consensus executable.
    pub path: PathBuf,
    /// Directory for the intermediate tree list file.
    pub workdir: PathBuf,
}

impl ConsensusBuilder for ExternalConsensus {
    fn name(&self) -> &str {
        "external-consensus"
    }

    fn build(&self, input: &ConsensusInput) -> Result<Tree> {
        if input.gene_trees.is_empty() {
            return Err(PipelineError::InsufficientData(
                "no gene trees available for external consensus".to_string(),
            )
            .into());
        }

        let trees_path = self.workdir.join("gene_trees.nwk");
        {
            let mut file = File::create(&trees_path)?;
            for tree in input.gene_trees {
                writeln!(file, "{}", tree.to_newick())?;
            }
        }

        let output = Command::new(&self.path)
            .arg(&trees_path)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| PipelineError::ExternalTool {
                tool: "consensus".to_string(),
                status: None,
                detail: format!("failed to spawn: {}", e),
            })?;
        if !output.status.success() {
            return Err(PipelineError::ExternalTool {
                tool: "consensus".to_string(),
                status: output.status.code(),
                detail: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .chars()
                    .take(500)
                    .collect(),
            }
            .into());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Tree::parse_newick(text.trim()).map_err(|e| {
            PipelineError::ExternalTool {
                tool: "consensus".to_string(),
                status: Some(0),
                detail: format!("unparsable consensus tree: {}", e),
            }
            .into()
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
