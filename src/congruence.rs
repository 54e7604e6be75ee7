//! Congruence Statistic Engine Module
//!
//! Compares every per-group gene tree against the consensus topology
//! restricted to the genomes that group actually covers, and reduces the
//! comparison to a normalized congruence score:
//!
//! 1. Restrict the consensus to the gene tree's leaf set (topology
//!    induction: drop leaves, collapse degree-2 internals)
//! 2. Robinson-Foulds bipartition distance between the two trees,
//!    normalized by 2*(n-3), the maximum number of non-trivial splits
//!    two unrooted n-leaf trees can disagree on
//! 3. Score = 1 - normalized distance, clamped to [0,1]
//!
//! Trees with fewer than 4 leaves carry no non-trivial bipartition
//! information; they are excluded, not scored as 0. The locus-level
//! aggregate weights each group by (n-3) so 4-leaf trees cannot dominate
//! it, and the report carries the exclusion count so callers can judge
//! statistical confidence.

use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::error::PipelineError;
use crate::genetree::{GroupFailure, GroupTree};
use crate::tree::Tree;

// ============================================================================
// Report Rows
// ============================================================================

/// One line of the congruence report.
#[derive(Debug, Clone)]
pub struct CongruenceRow {
    /// Homolog group id.
    pub group_id: u32,
    /// Leaves (genomes) in the group's gene tree.
    pub leaf_count: usize,
    /// Codon-alignment entropy carried over from the orchestrator
    /// (None for groups that failed before alignment finished).
    pub entropy: Option<f64>,
    /// Congruence score in [0,1]; None when excluded.
    pub score: Option<f64>,
    /// "scored" or a machine-readable exclusion reason.
    pub status: &'static str,
    /// Detail for excluded rows.
    pub detail: String,
}

/// Full congruence report for the locus.
#[derive(Debug)]
pub struct CongruenceReport {
    /// Per-group rows, ascending group id.
    pub rows: Vec<CongruenceRow>,
    /// Weighted mean congruence over scored groups (weight n-3);
    /// None when nothing was scorable.
    pub aggregate: Option<f64>,
    /// Number of scored groups.
    pub scored: usize,
    /// Number of excluded groups (too small, failed, inconsistent).
    pub excluded: usize,
}

// ============================================================================
// Scoring
// ============================================================================

/// Scores one gene tree against the consensus.
///
/// # Errors
/// - `InsufficientData` for trees with fewer than 4 leaves
/// - `Consistency` when the consensus cannot be restricted onto the
///   gene tree's exact leaf set
pub fn score_tree(gene_tree: &Tree, consensus: &Tree) -> anyhow::Result<f64> {
    let leaves: FxHashSet<String> = gene_tree.leaf_labels().into_iter().collect();
    let n = leaves.len();
    if n < 4 {
        return Err(PipelineError::InsufficientData(format!(
            "{} leaves carry no non-trivial bipartitions",
            n
        ))
        .into());
    }

    let restricted = consensus.restrict(&leaves).map_err(|e| {
        PipelineError::Consistency(format!("cannot restrict consensus: {}", e))
    })?;
    let restricted_leaves: FxHashSet<String> =
        restricted.leaf_labels().into_iter().collect();
    if restricted_leaves != leaves {
        return Err(PipelineError::Consistency(format!(
            "consensus covers {} of the gene tree's {} genomes",
            restricted_leaves.intersection(&leaves).count(),
            n
        ))
        .into());
    }

    let splits_gene = gene_tree.bipartitions();
    let splits_ref = restricted.bipartitions();
    let disagreement = splits_gene.symmetric_difference(&splits_ref).count();

    let max_disagreement = 2 * (n - 3);
    let normalized = disagreement as f64 / max_disagreement as f64;
    Ok((1.0 - normalized).clamp(0.0, 1.0))
}

/// Builds the complete report from the parallel phase's outcomes.
///
/// Scoring is independent per group and runs data-parallel; rows are
/// merged by group id afterwards, so the report is deterministic.
pub fn build_report(
    trees: &[GroupTree],
    failures: &[GroupFailure],
    consensus: &Tree,
) -> CongruenceReport {
    let mut rows: Vec<CongruenceRow> = trees
        .par_iter()
        .map(|gt| match score_tree(&gt.tree, consensus) {
            Ok(score) => CongruenceRow {
                group_id: gt.group_id,
                leaf_count: gt.leaf_count,
                entropy: Some(gt.entropy),
                score: Some(score),
                status: "scored",
                detail: String::new(),
            },
            Err(e) => {
                let status = match e.downcast_ref::<PipelineError>() {
                    Some(p) => p.reason_code(),
                    None => "io_error",
                };
                CongruenceRow {
                    group_id: gt.group_id,
                    leaf_count: gt.leaf_count,
                    entropy: Some(gt.entropy),
                    score: None,
                    status,
                    detail: e.to_string(),
                }
            }
        })
        .collect();

    for failure in failures {
        rows.push(CongruenceRow {
            group_id: failure.group_id,
            leaf_count: failure.leaf_count,
            entropy: None,
            score: None,
            status: failure.reason,
            detail: failure.detail.clone(),
        });
    }

    rows.sort_by_key(|r| r.group_id);

    let mut weight_sum = 0.0;
    let mut weighted = 0.0;
    let mut scored = 0usize;
    for row in &rows {
        if let Some(score) = row.score {
            let weight = (row.leaf_count - 3) as f64;
            weighted += weight * score;
            weight_sum += weight;
            scored += 1;
        }
    }

    CongruenceReport {
        aggregate: if weight_sum > 0.0 {
            Some(weighted / weight_sum)
        } else {
            None
        },
        scored,
        excluded: rows.len() - scored,
        rows,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusBuilder, ConsensusInput, DistanceConsensus};
    use crate::genetree::tests::{caterpillar, synthetic_catalog, StubAligner, StubTreeBuilder};
    use crate::genetree::build_gene_trees;
    use crate::groups::{resolve_groups, GroupStatus, ResolverConfig};
    use crate::simgraph::{SimilarityEdge, SimilarityGraph};
    use rustc_hash::FxHashMap;
    use std::fs;
    use std::path::PathBuf;

    fn tree(newick: &str) -> Tree {
        Tree::parse_newick(newick).unwrap()
    }

    fn group_tree(id: u32, t: &Tree) -> GroupTree {
        GroupTree {
            group_id: id,
            tree: t.clone(),
            leaf_count: t.leaf_count(),
            entropy: 0.0,
        }
    }

    #[test]
    fn test_identical_topology_scores_one() {
        let g = tree("(((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0,e:1.0);");
        let consensus = tree("(((a:2.0,b:2.0):2.0,c:2.0):2.0,d:2.0,e:2.0);");
        assert_eq!(score_tree(&g, &consensus).unwrap(), 1.0);
    }

    #[test]
    fn test_fully_discordant_five_leaf_scores_below_half() {
        let g = tree("(((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0,e:1.0);");
        // Both of g's splits ({a,b} and {d,e}) are absent here
        let consensus = tree("(((a:1.0,c:1.0):1.0,e:1.0):1.0,b:1.0,d:1.0);");
        let score = score_tree(&g, &consensus).unwrap();
        assert!(score < 0.5);
        assert_eq!(score, 0.0); // 4 disagreements / 2*(5-3)
    }

    #[test]
    fn test_half_discordant_hand_example() {
        // g splits: {c,d,e}, {d,e}; r splits: {c,d,e}, {c,d}
        let g = tree("(((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0,e:1.0);");
        let r = tree("((a:1.0,b:1.0):1.0,(c:1.0,d:1.0):1.0,e:1.0);");
        let score = score_tree(&g, &r).unwrap();
        assert_eq!(score, 0.5);
    }

    #[test]
    fn test_restriction_before_comparison() {
        // Consensus over 6 genomes, gene tree over 4
        let consensus =
            tree("(((a:1.0,b:1.0):1.0,(c:1.0,d:1.0):1.0):1.0,(e:1.0,f:1.0):1.0);");
        let g = tree("((a:1.0,b:1.0):1.0,(c:1.0,d:1.0):1.0);");
        assert_eq!(score_tree(&g, &consensus).unwrap(), 1.0);
    }

    #[test]
    fn test_small_tree_is_insufficient_data() {
        let g = tree("(a:1.0,b:1.0,c:1.0);");
        let consensus = tree("((a:1.0,b:1.0):1.0,c:1.0,d:1.0);");
        let err = score_tree(&g, &consensus).unwrap_err();
        let perr = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(perr.reason_code(), "insufficient_data");
    }

    #[test]
    fn test_missing_consensus_leaf_is_consistency_error() {
        let g = tree("((a:1.0,b:1.0):1.0,(c:1.0,z:1.0):1.0);");
        let consensus = tree("(((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0,e:1.0);");
        let err = score_tree(&g, &consensus).unwrap_err();
        let perr = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(perr.reason_code(), "consistency_error");
    }

    #[test]
    fn test_report_weighting_and_exclusions() {
        let consensus =
            tree("((((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0):1.0,e:1.0,f:1.0);");
        // 5-leaf tree congruent with the consensus (weight 2, score 1.0)
        let t5 = tree("((((a:1.0,b:1.0):1.0,c:1.0):1.0,d:1.0):1.0,e:1.0);");
        // 4-leaf tree fully discordant with the restriction (weight 1)
        let t4 = tree("((a:1.0,c:1.0):1.0,(b:1.0,d:1.0):1.0);");
        // 3-leaf tree: excluded
        let t3 = tree("(a:1.0,b:1.0,c:1.0);");

        let trees = vec![group_tree(1, &t5), group_tree(2, &t4), group_tree(3, &t3)];
        let failures = vec![GroupFailure {
            group_id: 4,
            leaf_count: 5,
            reason: "external_tool_failure",
            detail: "muscle crashed".to_string(),
        }];

        let report = build_report(&trees, &failures, &consensus);

        assert_eq!(report.rows.len(), 4);
        assert_eq!(report.scored, 2);
        assert_eq!(report.excluded, 2);

        // t4's restriction keeps splits {a,b}|{c,d}; t4 has {a,c}|{b,d}:
        // 2 disagreements over max 2 -> score 0. Weighted mean:
        // (2*1.0 + 1*0.0) / 3
        let agg = report.aggregate.unwrap();
        assert!((agg - 2.0 / 3.0).abs() < 1e-12);

        assert_eq!(report.rows[2].status, "insufficient_data");
        assert_eq!(report.rows[3].status, "external_tool_failure");
        assert!(report.rows[3].score.is_none());
    }

    // ------------------------------------------------------------------
    // End-to-end scenario with deterministic stand-ins
    // ------------------------------------------------------------------

    /// 5 genomes, one cross-genome gene chain plus 2 stray genes per
    /// genome: the resolver must yield exactly one scorable group with
    /// 5 leaves, and identical stub trees must score 1.0 end to end.
    fn run_scenario(tag: &str) -> (usize, usize, String, Vec<(u32, Option<f64>)>, Option<f64>) {
        const GENES: [(&str, &str, &str); 3] = [
            ("core", "MKVL", "ATGAAAGTTCTT"),
            ("s1", "MA", "ATGGCT"),
            ("s2", "MP", "ATGCCT"),
        ];
        let genomes: Vec<String> = (1..=5).map(|i| format!("g{}", i)).collect();
        let layout: Vec<(&str, &[(&str, &str, &str)])> =
            genomes.iter().map(|g| (g.as_str(), &GENES[..])).collect();
        let catalog = synthetic_catalog(&layout);

        // Chain the core genes (indices 0, 3, 6, 9, 12)
        let edges: Vec<SimilarityEdge> = (0..4)
            .map(|i| SimilarityEdge {
                a: i * 3,
                b: (i + 1) * 3,
                bitscore: 100.0,
                identity: 0.95,
                coverage: 0.95,
            })
            .collect();
        let graph = SimilarityGraph {
            gene_count: catalog.genes.len(),
            edges,
        };

        let set = resolve_groups(&catalog, &graph, &ResolverConfig::default());
        assert_eq!(set.retained().count(), 1);
        assert_eq!(set.count(GroupStatus::Singleton), 10);
        let core = set.retained().next().unwrap();
        assert_eq!(core.completeness, 1.0);
        assert_eq!(core.representatives.len(), 5);

        let base = std::env::temp_dir().join(format!(
            "locusphy_scenario_{}_{}",
            std::process::id(),
            tag
        ));
        let _ = fs::remove_dir_all(&base);
        let aln_dir: PathBuf = base.join("aln");
        let tree_dir: PathBuf = base.join("trees");
        fs::create_dir_all(&aln_dir).unwrap();
        fs::create_dir_all(&tree_dir).unwrap();

        let retained: Vec<_> = set.retained().collect();
        let outcome = build_gene_trees(
            &catalog,
            &retained,
            &StubAligner,
            &StubTreeBuilder,
            &aln_dir,
            &tree_dir,
            2,
            false,
        );
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.trees.len(), 1);
        assert_eq!(outcome.trees[0].leaf_count, 5);

        let mut membership: FxHashMap<String, FxHashSet<u32>> = FxHashMap::default();
        for group in &set.groups {
            for &m in &group.members {
                membership
                    .entry(catalog.genome_of(m).to_string())
                    .or_default()
                    .insert(group.id);
            }
        }

        let gene_trees: Vec<Tree> = outcome.trees.iter().map(|t| t.tree.clone()).collect();
        let consensus = DistanceConsensus::default()
            .build(&ConsensusInput {
                gene_trees: &gene_trees,
                membership: &membership,
            })
            .unwrap();

        let report = build_report(&outcome.trees, &outcome.failures, &consensus);
        let rows: Vec<(u32, Option<f64>)> =
            report.rows.iter().map(|r| (r.group_id, r.score)).collect();

        let result = (
            report.scored,
            report.excluded,
            consensus.to_newick(),
            rows,
            report.aggregate,
        );
        let _ = fs::remove_dir_all(&base);
        result
    }

    #[test]
    fn test_scenario_single_group_scores_one() {
        let (scored, excluded, _, rows, aggregate) = run_scenario("single");
        assert_eq!(scored, 1);
        assert_eq!(excluded, 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, Some(1.0));
        assert_eq!(aggregate, Some(1.0));
    }

    #[test]
    fn test_scenario_idempotence() {
        let first = run_scenario("idem_a");
        let second = run_scenario("idem_b");
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2); // identical consensus topology
        assert_eq!(first.3, second.3); // identical per-group scores
        assert_eq!(first.4, second.4);
    }

    // caterpillar() is exercised indirectly by the stubs; keep a direct
    // check so the fixture itself stays honest.
    #[test]
    fn test_caterpillar_fixture_shape() {
        let names: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let t = Tree::parse_newick(&caterpillar(&names)).unwrap();
        assert_eq!(t.leaf_count(), 5);
    }
}
