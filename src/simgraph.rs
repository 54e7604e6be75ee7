//! Similarity Graph Builder Module
//!
//! Drives the external pairwise search over all catalog proteins and
//! condenses the directed hit list into an undirected similarity graph:
//! one edge per gene pair, best bit score kept, self-hits and
//! sub-threshold hits discarded.
//!
//! A corrupted graph corrupts every downstream homolog group, so this
//! stage is fatal on any tool or parse failure; there is no partial
//! recovery.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::btab::BtabReader;
use crate::catalog::Catalog;
use crate::error::PipelineError;
use crate::seqio::write_fasta;
use crate::tools::Searcher;

// ============================================================================
// Data Structures
// ============================================================================

/// Thresholds applied to raw hits before they become graph edges.
///
/// Identity and coverage are fractions in [0,1]; hits below either, or
/// above the e-value ceiling, are dropped.
#[derive(Debug, Clone)]
pub struct GraphThresholds {
    pub min_identity: f64,
    pub min_coverage: f64,
    pub max_evalue: f64,
}

impl Default for GraphThresholds {
    fn default() -> Self {
        Self {
            min_identity: 0.3,
            min_coverage: 0.5,
            max_evalue: 0.001,
        }
    }
}

/// An undirected similarity edge between two catalog genes.
///
/// Invariant: `a < b` (canonical order); at most one edge per pair.
#[derive(Debug, Clone)]
pub struct SimilarityEdge {
    /// Lower catalog gene index.
    pub a: usize,
    /// Higher catalog gene index.
    pub b: usize,
    /// Best bit score observed in either search direction.
    pub bitscore: f64,
    /// Identity fraction of the best-scoring hit.
    pub identity: f64,
    /// Mutual coverage fraction of the best-scoring hit.
    pub coverage: f64,
}

/// The similarity graph over all catalog genes.
///
/// Consumed by the homolog group resolver and discarded afterwards.
#[derive(Debug)]
pub struct SimilarityGraph {
    /// Total number of catalog genes (graph node count).
    pub gene_count: usize,
    /// Deduplicated, thresholded edges.
    pub edges: Vec<SimilarityEdge>,
}

impl SimilarityGraph {
    /// Per-gene adjacency as indices into `edges`.
    pub fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.gene_count];
        for (idx, edge) in self.edges.iter().enumerate() {
            adj[edge.a].push(idx);
            adj[edge.b].push(idx);
        }
        adj
    }
}

// ============================================================================
// Graph Construction
// ============================================================================

/// Builds the similarity graph for the whole catalog.
///
/// # Steps
/// 1. Write every catalog protein to `workdir/proteins.faa`
/// 2. Run the search tool all-vs-all
/// 3. Parse hits, threshold, and merge symmetrically
///
/// # Errors
/// Fatal `ExternalTool` if the search tool fails or names a gene that is
/// not in the catalog (unparsable output).
pub fn build_graph(
    catalog: &Catalog,
    searcher: &dyn Searcher,
    workdir: &Path,
    thresholds: &GraphThresholds,
    threads: usize,
) -> Result<SimilarityGraph> {
    let proteins_path = workdir.join("proteins.faa");
    let hits_path = workdir.join("hits.tsv");

    let records: Vec<(String, String)> = (0..catalog.genes.len())
        .map(|idx| (catalog.wire_name(idx), catalog.genes[idx].protein.clone()))
        .collect();
    {
        let mut writer = BufWriter::new(
            File::create(&proteins_path)
                .with_context(|| format!("Failed to create {}", proteins_path.display()))?,
        );
        write_fasta(&mut writer, &records)?;
    }

    searcher.search(&proteins_path, &hits_path, threads)?;

    parse_hits(catalog, searcher.name(), &hits_path, thresholds)
}

/// Parses a tabular hit file into the deduplicated edge set.
///
/// Exposed separately so tests can exercise thresholding and merging
/// without a search invocation.
pub fn parse_hits(
    catalog: &Catalog,
    tool_name: &str,
    hits_path: &Path,
    thresholds: &GraphThresholds,
) -> Result<SimilarityGraph> {
    let mut best: FxHashMap<(usize, usize), SimilarityEdge> = FxHashMap::default();

    let reader = BtabReader::open(hits_path)?;
    for hit in reader {
        let hit = hit?;

        let query = catalog.gene_by_wire_name(&hit.query).ok_or_else(|| {
            PipelineError::ExternalTool {
                tool: tool_name.to_string(),
                status: Some(0),
                detail: format!("hit names unknown gene: {}", hit.query),
            }
        })?;
        let subject = catalog.gene_by_wire_name(&hit.subject).ok_or_else(|| {
            PipelineError::ExternalTool {
                tool: tool_name.to_string(),
                status: Some(0),
                detail: format!("hit names unknown gene: {}", hit.subject),
            }
        })?;

        if query == subject {
            continue;
        }

        let identity = hit.identity / 100.0;
        let coverage = hit.mutual_coverage();
        if identity < thresholds.min_identity
            || coverage < thresholds.min_coverage
            || hit.evalue > thresholds.max_evalue
        {
            continue;
        }

        let key = (query.min(subject), query.max(subject));
        let edge = SimilarityEdge {
            a: key.0,
            b: key.1,
            bitscore: hit.bitscore,
            identity,
            coverage,
        };

        best.entry(key)
            .and_modify(|existing| {
                if edge.bitscore > existing.bitscore {
                    *existing = edge.clone();
                }
            })
            .or_insert(edge);
    }

    let mut edges: Vec<SimilarityEdge> = best.into_values().collect();
    edges.sort_by(|x, y| (x.a, x.b).cmp(&(y.a, y.b)));

    Ok(SimilarityGraph {
        gene_count: catalog.genes.len(),
        edges,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn fixture_catalog(dir: &Path) -> Catalog {
        for genome in ["gA", "gB"] {
            let mut faa = fs::File::create(dir.join(format!("{}.faa", genome))).unwrap();
            let mut ffn = fs::File::create(dir.join(format!("{}.ffn", genome))).unwrap();
            for tag in ["g1", "g2"] {
                writeln!(faa, ">{}\nMKVL", tag).unwrap();
                writeln!(ffn, ">{}\nATGAAAGTTCTT", tag).unwrap();
            }
        }
        crate::catalog::load_catalog(dir, None).unwrap()
    }

    fn hit_line(q: &str, s: &str, ident: f64, evalue: f64, bits: f64) -> String {
        format!(
            "{}\t{}\t{}\t4\t0\t0\t1\t4\t1\t4\t{}\t{}\t4\t4",
            q, s, ident, evalue, bits
        )
    }

    fn workdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "locusphy_simgraph_{}_{}",
            std::process::id(),
            tag
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_symmetric_merge_keeps_best_score() {
        let dir = workdir("merge");
        let catalog = fixture_catalog(&dir);

        let hits = dir.join("hits.tsv");
        let content = [
            hit_line("gA|g1", "gA|g1", 100.0, 1e-80, 500.0), // self-hit, dropped
            hit_line("gA|g1", "gB|g1", 90.0, 1e-40, 200.0),
            hit_line("gB|g1", "gA|g1", 91.0, 1e-42, 210.0), // reverse, better score
        ]
        .join("\n");
        fs::write(&hits, content).unwrap();

        let graph =
            parse_hits(&catalog, "stub", &hits, &GraphThresholds::default()).unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].bitscore, 210.0);
        assert!((graph.edges[0].identity - 0.91).abs() < 1e-9);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_threshold_filtering() {
        let dir = workdir("thresh");
        let catalog = fixture_catalog(&dir);

        let hits = dir.join("hits.tsv");
        let content = [
            hit_line("gA|g1", "gB|g1", 20.0, 1e-40, 100.0), // identity too low
            hit_line("gA|g2", "gB|g2", 90.0, 0.5, 100.0),   // e-value too high
            hit_line("gA|g1", "gB|g2", 90.0, 1e-40, 100.0), // passes
        ]
        .join("\n");
        fs::write(&hits, content).unwrap();

        let graph =
            parse_hits(&catalog, "stub", &hits, &GraphThresholds::default()).unwrap();
        assert_eq!(graph.edges.len(), 1);
        let e = &graph.edges[0];
        assert_eq!(catalog.wire_name(e.a), "gA|g1");
        assert_eq!(catalog.wire_name(e.b), "gB|g2");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unknown_gene_is_tool_failure() {
        let dir = workdir("unknown");
        let catalog = fixture_catalog(&dir);

        let hits = dir.join("hits.tsv");
        fs::write(&hits, hit_line("gX|nope", "gA|g1", 90.0, 1e-40, 100.0)).unwrap();

        let err = parse_hits(&catalog, "stub", &hits, &GraphThresholds::default())
            .unwrap_err();
        let perr = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(perr.reason_code(), "external_tool_failure");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_adjacency() {
        let graph = SimilarityGraph {
            gene_count: 3,
            edges: vec![
                SimilarityEdge { a: 0, b: 1, bitscore: 1.0, identity: 0.9, coverage: 0.9 },
                SimilarityEdge { a: 1, b: 2, bitscore: 1.0, identity: 0.9, coverage: 0.9 },
            ],
        };
        let adj = graph.adjacency();
        assert_eq!(adj[0], vec![0]);
        assert_eq!(adj[1], vec![0, 1]);
        assert_eq!(adj[2], vec![1]);
    }
}
