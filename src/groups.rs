//! Homolog Group Resolver Module
//!
//! Partitions the similarity graph into homolog groups: connected
//! components by default, with a reciprocal-best-hit split rule applied
//! to components carrying multiple genes from the same genome when
//! running in strict (single-copy) mode.
//!
//! # Resolution Algorithm
//! 1. Union-find over all genes, one union per similarity edge
//! 2. Components with at most one gene per genome become groups directly
//! 3. Multi-copy components in strict mode are split: reciprocal best
//!    hits seed sub-groups, remaining genes attach to the sub-group
//!    holding their highest-scoring edge (ties to the lower sub-group)
//! 4. Edge-less genes form singleton groups
//!
//! The output is always a partition of the catalog: every gene belongs
//! to exactly one group. Group ids are assigned by ascending smallest
//! member index, making the whole resolution deterministic for a given
//! catalog and edge set.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::catalog::Catalog;
use crate::simgraph::SimilarityGraph;

// ============================================================================
// Union-Find
// ============================================================================

/// Disjoint-set forest over dense indices with path compression and
/// union by rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Resolver behavior switches.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Keep multi-copy components whole instead of splitting them.
    pub paralog_tolerant: bool,
    /// Minimum completeness fraction for phylogenetic retention.
    pub min_completeness: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            paralog_tolerant: false,
            min_completeness: 0.5,
        }
    }
}

/// Why a group is or is not carried into the phylogenetic phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Carried into alignment and tree building.
    Retained,
    /// A single edge-less gene; never tree-buildable.
    Singleton,
    /// Fewer than three genomes represented; a tree needs >= 3 leaves.
    TooSmall,
    /// Completeness fraction below the configured minimum.
    Incomplete,
}

impl GroupStatus {
    /// Label used in the groups table.
    pub fn label(&self) -> &'static str {
        match self {
            GroupStatus::Retained => "retained",
            GroupStatus::Singleton => "singleton",
            GroupStatus::TooSmall => "too_small",
            GroupStatus::Incomplete => "incomplete",
        }
    }
}

/// A homolog group: a set of genes inferred to share ancestry.
#[derive(Debug, Clone)]
pub struct HomologGroup {
    /// Group id (1-based, stable for a given input).
    pub id: u32,
    /// Member gene indices, ascending.
    pub members: Vec<usize>,
    /// One representative gene per genome (see `select_representatives`),
    /// ordered by genome id.
    pub representatives: Vec<usize>,
    /// Genomes represented / total genomes.
    pub completeness: f64,
    /// True when this group came out of a paralog component split.
    pub paralog_split: bool,
    /// Retention classification.
    pub status: GroupStatus,
}

impl HomologGroup {
    /// Number of distinct genomes represented in this group.
    pub fn genome_count(&self, catalog: &Catalog) -> usize {
        let genomes: FxHashSet<usize> =
            self.members.iter().map(|&m| catalog.genes[m].genome).collect();
        genomes.len()
    }
}

/// The resolver's complete output.
#[derive(Debug)]
pub struct GroupSet {
    /// All groups, ascending id. Together they partition the catalog.
    pub groups: Vec<HomologGroup>,
}

impl GroupSet {
    /// Groups carried into the phylogenetic phase.
    pub fn retained(&self) -> impl Iterator<Item = &HomologGroup> {
        self.groups
            .iter()
            .filter(|g| g.status == GroupStatus::Retained)
    }

    /// Count of groups with a given status.
    pub fn count(&self, status: GroupStatus) -> usize {
        self.groups.iter().filter(|g| g.status == status).count()
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Partitions the catalog into homolog groups using the similarity graph.
pub fn resolve_groups(
    catalog: &Catalog,
    graph: &SimilarityGraph,
    config: &ResolverConfig,
) -> GroupSet {
    let n = graph.gene_count;
    let adjacency = graph.adjacency();

    let mut uf = UnionFind::new(n);
    for edge in &graph.edges {
        uf.union(edge.a, edge.b);
    }

    // Components in deterministic order (keyed by smallest member, which
    // is the first encountered in ascending gene order).
    let mut components: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    let mut order: Vec<usize> = Vec::new();
    for gene in 0..n {
        let root = uf.find(gene);
        let entry = components.entry(root).or_default();
        if entry.is_empty() {
            order.push(root);
        }
        entry.push(gene);
    }

    let mut member_sets: Vec<(Vec<usize>, bool)> = Vec::new();
    for root in order {
        let members = components.remove(&root).unwrap();
        if members.len() == 1 {
            member_sets.push((members, false));
            continue;
        }

        let multi_copy = has_multi_copy_genome(catalog, &members);
        if !multi_copy || config.paralog_tolerant {
            member_sets.push((members, false));
        } else {
            for split in split_component(catalog, graph, &adjacency, &members) {
                member_sets.push((split, true));
            }
        }
    }

    member_sets.sort_by_key(|(members, _)| members[0]);

    let total_genomes = catalog.genome_count();
    let mut groups = Vec::with_capacity(member_sets.len());
    for (idx, (members, paralog_split)) in member_sets.into_iter().enumerate() {
        let genomes: FxHashSet<usize> =
            members.iter().map(|&m| catalog.genes[m].genome).collect();
        let completeness = genomes.len() as f64 / total_genomes as f64;

        let status = if members.len() == 1 {
            GroupStatus::Singleton
        } else if genomes.len() < 3 {
            GroupStatus::TooSmall
        } else if completeness < config.min_completeness {
            GroupStatus::Incomplete
        } else {
            GroupStatus::Retained
        };

        let representatives = select_representatives(catalog, graph, &adjacency, &members);

        groups.push(HomologGroup {
            id: (idx + 1) as u32,
            members,
            representatives,
            completeness,
            paralog_split,
            status,
        });
    }

    GroupSet { groups }
}

/// True when any genome contributes more than one gene to the component.
fn has_multi_copy_genome(catalog: &Catalog, members: &[usize]) -> bool {
    let mut seen: FxHashSet<usize> = FxHashSet::default();
    for &m in members {
        if !seen.insert(catalog.genes[m].genome) {
            return true;
        }
    }
    false
}

/// Splits a multi-copy component into paralog groups.
///
/// Reciprocal-best-hit pairs seed sub-groups; each gene left in a
/// singleton seed joins the sub-group at the far end of its
/// highest-scoring edge, ties resolved toward the sub-group with the
/// smaller provisional id (its smallest member index). Genes are
/// processed in ascending index order so the outcome is deterministic.
fn split_component(
    catalog: &Catalog,
    graph: &SimilarityGraph,
    adjacency: &[Vec<usize>],
    members: &[usize],
) -> Vec<Vec<usize>> {
    let member_set: FxHashSet<usize> = members.iter().copied().collect();

    // Best cross-genome hit per (gene, target genome): highest bit score,
    // ties to the lower gene index.
    let mut best_hit: FxHashMap<(usize, usize), (usize, f64)> = FxHashMap::default();
    for &gene in members {
        for &eidx in &adjacency[gene] {
            let edge = &graph.edges[eidx];
            let other = if edge.a == gene { edge.b } else { edge.a };
            if !member_set.contains(&other) {
                continue;
            }
            let other_genome = catalog.genes[other].genome;
            if other_genome == catalog.genes[gene].genome {
                continue;
            }
            let entry = best_hit
                .entry((gene, other_genome))
                .or_insert((other, edge.bitscore));
            if edge.bitscore > entry.1 || (edge.bitscore == entry.1 && other < entry.0) {
                *entry = (other, edge.bitscore);
            }
        }
    }

    // Seed sub-groups from reciprocal best hits.
    let mut local: FxHashMap<usize, usize> = FxHashMap::default();
    for (i, &m) in members.iter().enumerate() {
        local.insert(m, i);
    }
    let mut uf = UnionFind::new(members.len());
    for edge in &graph.edges {
        let (a, b) = (edge.a, edge.b);
        if !member_set.contains(&a) || !member_set.contains(&b) {
            continue;
        }
        let ga = catalog.genes[a].genome;
        let gb = catalog.genes[b].genome;
        if ga == gb {
            continue;
        }
        let a_best = best_hit.get(&(a, gb)).map(|&(hit, _)| hit);
        let b_best = best_hit.get(&(b, ga)).map(|&(hit, _)| hit);
        if a_best == Some(b) && b_best == Some(a) {
            uf.union(local[&a], local[&b]);
        }
    }

    // Attach leftover singleton seeds by best edge.
    for &gene in members {
        let li = local[&gene];
        let root = uf.find(li);
        let seed_size = members
            .iter()
            .filter(|&&m| uf.find(local[&m]) == root)
            .count();
        if seed_size > 1 {
            continue;
        }

        let mut candidate: Option<(f64, usize, usize)> = None; // (score, group min member, local idx)
        for &eidx in &adjacency[gene] {
            let edge = &graph.edges[eidx];
            let other = if edge.a == gene { edge.b } else { edge.a };
            if !member_set.contains(&other) || other == gene {
                continue;
            }
            let other_root = uf.find(local[&other]);
            if other_root == uf.find(li) {
                continue;
            }
            let group_min = members
                .iter()
                .filter(|&&m| uf.find(local[&m]) == other_root)
                .min()
                .copied()
                .unwrap();
            let better = match candidate {
                None => true,
                Some((score, min_member, _)) => {
                    edge.bitscore > score
                        || (edge.bitscore == score && group_min < min_member)
                }
            };
            if better {
                candidate = Some((edge.bitscore, group_min, local[&other]));
            }
        }

        if let Some((_, _, target)) = candidate {
            uf.union(li, target);
        }
    }

    let mut sub: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for &gene in members {
        sub.entry(uf.find(local[&gene])).or_default().push(gene);
    }
    let mut result: Vec<Vec<usize>> = sub.into_values().collect();
    for group in &mut result {
        group.sort_unstable();
    }
    result.sort_by_key(|g| g[0]);
    result
}

/// Picks one representative gene per genome for tree building.
///
/// The representative maximizes the summed bit score of its within-group
/// edges; ties break toward the lexicographically smallest locus tag.
/// Output is ordered by genome id so downstream leaf order is stable.
fn select_representatives(
    catalog: &Catalog,
    graph: &SimilarityGraph,
    adjacency: &[Vec<usize>],
    members: &[usize],
) -> Vec<usize> {
    let member_set: FxHashSet<usize> = members.iter().copied().collect();

    let mut by_genome: FxHashMap<usize, (usize, f64)> = FxHashMap::default();
    for &gene in members {
        let score: f64 = adjacency[gene]
            .iter()
            .map(|&eidx| &graph.edges[eidx])
            .filter(|e| {
                let other = if e.a == gene { e.b } else { e.a };
                member_set.contains(&other)
            })
            .map(|e| e.bitscore)
            .sum();

        let genome = catalog.genes[gene].genome;
        match by_genome.get(&genome) {
            None => {
                by_genome.insert(genome, (gene, score));
            }
            Some(&(current, current_score)) => {
                let replace = score > current_score
                    || (score == current_score
                        && catalog.genes[gene].locus_tag < catalog.genes[current].locus_tag);
                if replace {
                    by_genome.insert(genome, (gene, score));
                }
            }
        }
    }

    let mut reps: Vec<(usize, usize)> = by_genome
        .into_iter()
        .map(|(genome, (gene, _))| (genome, gene))
        .collect();
    reps.sort_by(|a, b| catalog.genomes[a.0].id.cmp(&catalog.genomes[b.0].id));
    reps.into_iter().map(|(_, gene)| gene).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Gene, Genome};
    use crate::simgraph::SimilarityEdge;

    /// Builds an in-memory catalog: `genes[i]` lists locus tags per genome.
    fn synthetic_catalog(genomes: &[(&str, &[&str])]) -> Catalog {
        let mut catalog = Catalog::default();
        for (gid, (name, tags)) in genomes.iter().enumerate() {
            let mut gene_indices = Vec::new();
            for tag in tags.iter() {
                let idx = catalog.genes.len();
                catalog.genes.push(Gene {
                    genome: gid,
                    locus_tag: tag.to_string(),
                    protein: "MKV".to_string(),
                    nucleotide: "ATGAAAGTT".to_string(),
                    coords: None,
                });
                gene_indices.push(idx);
            }
            catalog.genomes.push(Genome {
                id: name.to_string(),
                genes: gene_indices,
            });
        }
        catalog
    }

    fn edge(a: usize, b: usize, bits: f64) -> SimilarityEdge {
        SimilarityEdge {
            a: a.min(b),
            b: a.max(b),
            bitscore: bits,
            identity: 0.9,
            coverage: 0.9,
        }
    }

    fn graph(n: usize, edges: Vec<SimilarityEdge>) -> SimilarityGraph {
        SimilarityGraph {
            gene_count: n,
            edges,
        }
    }

    #[test]
    fn test_partition_invariant() {
        // 3 genomes x 2 genes; one cross-genome chain plus strays
        let catalog = synthetic_catalog(&[
            ("gA", &["a1", "a2"]),
            ("gB", &["b1", "b2"]),
            ("gC", &["c1", "c2"]),
        ]);
        let g = graph(6, vec![edge(0, 2, 100.0), edge(2, 4, 90.0), edge(1, 3, 80.0)]);

        let set = resolve_groups(&catalog, &g, &ResolverConfig::default());

        let mut seen: FxHashSet<usize> = FxHashSet::default();
        let mut total = 0;
        for group in &set.groups {
            for &m in &group.members {
                assert!(seen.insert(m), "gene {} appears in two groups", m);
                total += 1;
            }
        }
        assert_eq!(total, 6);
    }

    #[test]
    fn test_spanning_component_single_group() {
        let catalog =
            synthetic_catalog(&[("gA", &["a1"]), ("gB", &["b1"]), ("gC", &["c1"])]);
        let g = graph(3, vec![edge(0, 1, 100.0), edge(1, 2, 100.0)]);

        let set = resolve_groups(&catalog, &g, &ResolverConfig::default());
        assert_eq!(set.groups.len(), 1);
        let group = &set.groups[0];
        assert_eq!(group.completeness, 1.0);
        assert_eq!(group.status, GroupStatus::Retained);
        assert_eq!(group.members, vec![0, 1, 2]);
        assert_eq!(group.representatives.len(), 3);
    }

    #[test]
    fn test_rbh_split_in_strict_mode() {
        // Two genomes with two paralogous copies each. RBH pairs
        // (a1,b1) and (a2,b2); weaker cross edges link the copies.
        let catalog = synthetic_catalog(&[("gA", &["a1", "a2"]), ("gB", &["b1", "b2"])]);
        // genes: 0=a1 1=a2 2=b1 3=b2
        let edges = vec![
            edge(0, 2, 300.0), // a1-b1 RBH
            edge(1, 3, 280.0), // a2-b2 RBH
            edge(0, 3, 120.0),
            edge(1, 2, 110.0),
        ];
        let g = graph(4, edges.clone());

        let strict = resolve_groups(&catalog, &g, &ResolverConfig::default());
        let split_groups: Vec<_> =
            strict.groups.iter().filter(|g| g.members.len() > 1).collect();
        assert_eq!(split_groups.len(), 2);
        assert!(split_groups.iter().all(|g| g.paralog_split));
        assert_eq!(split_groups[0].members, vec![0, 2]);
        assert_eq!(split_groups[1].members, vec![1, 3]);

        let tolerant = resolve_groups(
            &catalog,
            &graph(4, edges),
            &ResolverConfig {
                paralog_tolerant: true,
                ..ResolverConfig::default()
            },
        );
        assert_eq!(tolerant.groups.len(), 1);
        assert_eq!(tolerant.groups[0].members, vec![0, 1, 2, 3]);
        assert!(!tolerant.groups[0].paralog_split);
    }

    #[test]
    fn test_singletons_and_completeness_filter() {
        let catalog = synthetic_catalog(&[
            ("gA", &["a1", "a2"]),
            ("gB", &["b1", "b2"]),
            ("gC", &["c1"]),
            ("gD", &["d1"]),
        ]);
        // One group spanning only gA+gB+gC (0.75 completeness), strays elsewhere
        let g = graph(6, vec![edge(0, 2, 100.0), edge(2, 4, 90.0)]);

        let config = ResolverConfig {
            paralog_tolerant: false,
            min_completeness: 0.8,
        };
        let set = resolve_groups(&catalog, &g, &config);

        assert_eq!(set.count(GroupStatus::Singleton), 3); // a2, b2, d1
        assert_eq!(set.count(GroupStatus::Incomplete), 1);
        assert_eq!(set.count(GroupStatus::Retained), 0);
        assert_eq!(set.retained().count(), 0);
    }

    #[test]
    fn test_representative_selection_prefers_strong_edges() {
        let catalog = synthetic_catalog(&[("gA", &["a1", "a2"]), ("gB", &["b1"]), ("gC", &["c1"])]);
        // a2 carries much stronger edges than a1
        let g = graph(
            4,
            vec![
                edge(0, 2, 50.0),  // a1-b1
                edge(1, 2, 200.0), // a2-b1
                edge(1, 3, 210.0), // a2-c1
                edge(0, 3, 40.0),  // a1-c1
            ],
        );

        let set = resolve_groups(
            &catalog,
            &g,
            &ResolverConfig {
                paralog_tolerant: true,
                min_completeness: 0.0,
            },
        );
        assert_eq!(set.groups.len(), 1);
        let reps = &set.groups[0].representatives;
        assert_eq!(reps.len(), 3);
        // Representative for gA is a2 (gene index 1)
        assert!(reps.contains(&1));
        assert!(!reps.contains(&0));
    }

    #[test]
    fn test_deterministic_ids() {
        let catalog =
            synthetic_catalog(&[("gA", &["a1"]), ("gB", &["b1"]), ("gC", &["c1"])]);
        let g1 = graph(3, vec![edge(0, 1, 100.0), edge(1, 2, 100.0)]);
        let g2 = graph(3, vec![edge(1, 2, 100.0), edge(0, 1, 100.0)]);

        let s1 = resolve_groups(&catalog, &g1, &ResolverConfig::default());
        let s2 = resolve_groups(&catalog, &g2, &ResolverConfig::default());
        let ids1: Vec<_> = s1.groups.iter().map(|g| (g.id, g.members.clone())).collect();
        let ids2: Vec<_> = s2.groups.iter().map(|g| (g.id, g.members.clone())).collect();
        assert_eq!(ids1, ids2);
    }
}
