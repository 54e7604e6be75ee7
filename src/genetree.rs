//! Per-Group Alignment & Tree Orchestrator Module
//!
//! Drives the external aligner and tree builder for every retained
//! homolog group: representative proteins out, protein alignment back,
//! codon-aware nucleotide alignment derived in place, maximum-likelihood
//! tree parsed and validated.
//!
//! A failure in one group (alignment crash, codon length mismatch,
//! unparsable tree) is isolated: it is recorded with its error class and
//! the group is excluded downstream. It never aborts the run.
//!
//! Groups are independent, so they are processed by a bounded worker
//! pool; the only shared state is the results vector, merged by group id
//! after the pool drains so output order is scheduling-independent.

use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use crate::catalog::Catalog;
use crate::error::PipelineError;
use crate::groups::HomologGroup;
use crate::seqio::{write_fasta, FastaFile};
use crate::tools::{Aligner, TreeBuilder};
use crate::tree::Tree;

// ============================================================================
// Worker Pool Primitives
// ============================================================================

/// Counting semaphore bounding concurrent group workers.
struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cvar: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cvar.notify_one();
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// A successfully built per-group gene tree.
#[derive(Debug, Clone)]
pub struct GroupTree {
    /// Homolog group id.
    pub group_id: u32,
    /// Gene tree with leaves renamed to genome ids.
    pub tree: Tree,
    /// Number of leaves (= genomes represented).
    pub leaf_count: usize,
    /// Mean per-site nucleotide entropy of the codon alignment.
    pub entropy: f64,
}

/// A recorded, non-fatal per-group failure.
#[derive(Debug, Clone)]
pub struct GroupFailure {
    /// Homolog group id.
    pub group_id: u32,
    /// Leaves the group would have contributed.
    pub leaf_count: usize,
    /// Machine-readable exclusion reason.
    pub reason: &'static str,
    /// Human-readable detail for the log and report.
    pub detail: String,
}

/// Combined output of the parallel phase, both sides sorted by group id.
#[derive(Debug)]
pub struct PhyloOutcome {
    pub trees: Vec<GroupTree>,
    pub failures: Vec<GroupFailure>,
}

// ============================================================================
// Orchestration
// ============================================================================

/// Builds gene trees for all retained groups with a bounded worker pool.
///
/// # Arguments
/// * `aln_dir` / `tree_dir` - artifact directories (must exist)
/// * `workers` - maximum concurrent external-tool invocations
pub fn build_gene_trees(
    catalog: &Catalog,
    groups: &[&HomologGroup],
    aligner: &dyn Aligner,
    tree_builder: &dyn TreeBuilder,
    aln_dir: &Path,
    tree_dir: &Path,
    workers: usize,
    verbose: bool,
) -> PhyloOutcome {
    let results: Arc<Mutex<Vec<(u32, Result<GroupTree>)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(groups.len())));
    let semaphore = Semaphore::new(workers.max(1));

    std::thread::scope(|s| {
        for group in groups {
            let results = Arc::clone(&results);
            let sem = &semaphore;

            s.spawn(move || {
                sem.acquire();
                let outcome = process_group(
                    catalog,
                    group,
                    aligner,
                    tree_builder,
                    aln_dir,
                    tree_dir,
                );
                if verbose {
                    match &outcome {
                        Ok(gt) => eprintln!(
                            "  HG_{}: tree with {} leaves (entropy {:.3})",
                            group.id, gt.leaf_count, gt.entropy
                        ),
                        Err(e) => eprintln!("  HG_{}: excluded ({})", group.id, e),
                    }
                }
                results.lock().unwrap().push((group.id, outcome));
                sem.release();
            });
        }
    });

    let collected = Arc::try_unwrap(results)
        .expect("All workers should have finished")
        .into_inner()
        .unwrap();

    let mut trees = Vec::new();
    let mut failures = Vec::new();
    for (group_id, outcome) in collected {
        match outcome {
            Ok(tree) => trees.push(tree),
            Err(e) => {
                let leaf_count = groups
                    .iter()
                    .find(|g| g.id == group_id)
                    .map(|g| g.representatives.len())
                    .unwrap_or(0);
                let reason = match e.downcast_ref::<PipelineError>() {
                    Some(p) => p.reason_code(),
                    None => "io_error",
                };
                failures.push(GroupFailure {
                    group_id,
                    leaf_count,
                    reason,
                    detail: e.to_string(),
                });
            }
        }
    }

    // Deterministic merge regardless of scheduling order
    trees.sort_by_key(|t| t.group_id);
    failures.sort_by_key(|f| f.group_id);

    PhyloOutcome { trees, failures }
}

/// Runs the full alignment + tree chain for one group.
fn process_group(
    catalog: &Catalog,
    group: &HomologGroup,
    aligner: &dyn Aligner,
    tree_builder: &dyn TreeBuilder,
    aln_dir: &Path,
    tree_dir: &Path,
) -> Result<GroupTree> {
    let reps = &group.representatives;
    if reps.len() < 3 {
        return Err(PipelineError::InsufficientData(format!(
            "group HG_{} has {} genomes, tree building needs at least 3",
            group.id,
            reps.len()
        ))
        .into());
    }

    let faa_path = aln_dir.join(format!("HG_{}.faa", group.id));
    let aln_path = aln_dir.join(format!("HG_{}.faa.aln", group.id));
    let codon_path = aln_dir.join(format!("HG_{}.codon.aln", group.id));
    let tree_path = tree_dir.join(format!("HG_{}.nwk", group.id));

    let records: Vec<(String, String)> = reps
        .iter()
        .map(|&g| (catalog.wire_name(g), catalog.genes[g].protein.clone()))
        .collect();
    {
        let mut writer = BufWriter::new(
            File::create(&faa_path)
                .with_context(|| format!("Failed to create {}", faa_path.display()))?,
        );
        write_fasta(&mut writer, &records)?;
    }

    aligner.align(&faa_path, &aln_path)?;

    let aligned = FastaFile::open(&aln_path)?.read_all()?;
    let codon_records = back_translate(catalog, group.id, reps, &aligned)?;
    {
        let mut writer = BufWriter::new(File::create(&codon_path)?);
        write_fasta(&mut writer, &codon_records)?;
    }

    let codon_seqs: Vec<&str> = codon_records.iter().map(|(_, s)| s.as_str()).collect();
    let entropy = msa_entropy(&codon_seqs);

    tree_builder.build_tree(&codon_path, &tree_path)?;

    let newick = std::fs::read_to_string(&tree_path)
        .with_context(|| format!("Failed to read {}", tree_path.display()))?;
    let tree = Tree::parse_newick(&newick).map_err(|e| PipelineError::ExternalTool {
        tool: tree_builder.name().to_string(),
        status: Some(0),
        detail: format!("unparsable tree for HG_{}: {}", group.id, e),
    })?;

    let tree = relabel_to_genomes(catalog, group, tree)?;
    let leaf_count = tree.leaf_count();

    Ok(GroupTree {
        group_id: group.id,
        tree,
        leaf_count,
        entropy,
    })
}

// ============================================================================
// Codon Back-Translation
// ============================================================================

/// Converts a protein alignment into a codon-aware nucleotide alignment
/// using the members' CDS sequences.
///
/// Positional correspondence is mandatory: each CDS must be exactly 3x
/// the ungapped protein length, or 3x + 3 with a trailing stop codon.
/// Anything else is a `Consistency` error for the group.
pub fn back_translate(
    catalog: &Catalog,
    group_id: u32,
    members: &[usize],
    aligned: &[crate::seqio::FastaRecord],
) -> Result<Vec<(String, String)>> {
    let expected: FxHashSet<String> = members.iter().map(|&g| catalog.wire_name(g)).collect();
    let got: FxHashSet<String> = aligned.iter().map(|r| r.name.clone()).collect();
    if expected != got {
        return Err(PipelineError::Consistency(format!(
            "HG_{}: aligner returned a different sequence set than submitted",
            group_id
        ))
        .into());
    }

    let mut out = Vec::with_capacity(aligned.len());
    for record in aligned {
        let gene = catalog
            .gene_by_wire_name(&record.name)
            .expect("validated above");
        let nucl = &catalog.genes[gene].nucleotide;

        let residues = record.seq.chars().filter(|&c| c != '-').count();
        if nucl.len() != residues * 3 && nucl.len() != residues * 3 + 3 {
            return Err(PipelineError::Consistency(format!(
                "HG_{}: {} has {} aligned residues but a {} nt CDS (expected {} or {})",
                group_id,
                record.name,
                residues,
                nucl.len(),
                residues * 3,
                residues * 3 + 3
            ))
            .into());
        }

        let mut codon_seq = String::with_capacity(record.seq.len() * 3);
        let mut offset = 0;
        for c in record.seq.chars() {
            if c == '-' {
                codon_seq.push_str("---");
            } else {
                codon_seq.push_str(&nucl[offset..offset + 3]);
                offset += 3;
            }
        }
        out.push((record.name.clone(), codon_seq));
    }

    Ok(out)
}

// ============================================================================
// Alignment Entropy
// ============================================================================

/// Mean per-site base-4 nucleotide entropy across alignment columns.
///
/// Sites where 10% or more of the rows are not a plain A/C/G/T
/// (gaps, Ns) are skipped; a fully skipped alignment scores 0.
pub fn msa_entropy(seqs: &[&str]) -> f64 {
    if seqs.is_empty() {
        return 0.0;
    }
    let rows: Vec<&[u8]> = seqs.iter().map(|s| s.as_bytes()).collect();
    let ncols = rows.iter().map(|r| r.len()).min().unwrap_or(0);
    let nrows = rows.len() as f64;

    let mut total = 0.0;
    let mut accounted = 0usize;

    for col in 0..ncols {
        let mut counts = [0usize; 4];
        let mut valid = 0usize;
        for row in &rows {
            match row[col].to_ascii_uppercase() {
                b'A' => counts[0] += 1,
                b'C' => counts[1] += 1,
                b'G' => counts[2] += 1,
                b'T' => counts[3] += 1,
                _ => continue,
            }
            valid += 1;
        }

        let missing_prop = (nrows - valid as f64) / nrows;
        if missing_prop >= 0.1 {
            continue;
        }

        let mut site = 0.0;
        for &c in &counts {
            if c > 0 {
                let p = c as f64 / valid as f64;
                site -= p * p.ln();
            }
        }
        total += site / 4.0f64.ln();
        accounted += 1;
    }

    if accounted == 0 {
        0.0
    } else {
        total / accounted as f64
    }
}

// ============================================================================
// Leaf Relabeling
// ============================================================================

/// Renames `genome|locus_tag` leaves to bare genome ids and checks the
/// resulting leaf set matches the group's genomes exactly.
fn relabel_to_genomes(catalog: &Catalog, group: &HomologGroup, mut tree: Tree) -> Result<Tree> {
    let expected: FxHashSet<String> = group
        .representatives
        .iter()
        .map(|&g| catalog.genome_of(g).to_string())
        .collect();

    let mut seen: FxHashSet<String> = FxHashSet::default();
    for idx in 0..tree.nodes.len() {
        if !tree.nodes[idx].children.is_empty() {
            continue;
        }
        let label = match &tree.nodes[idx].label {
            Some(l) => l.clone(),
            None => continue,
        };
        let genome = label.split('|').next().unwrap_or("").to_string();
        if !expected.contains(&genome) {
            return Err(PipelineError::Consistency(format!(
                "HG_{}: tree leaf {} does not map to a member genome",
                group.id, label
            ))
            .into());
        }
        if !seen.insert(genome.clone()) {
            return Err(PipelineError::Consistency(format!(
                "HG_{}: genome {} appears on multiple tree leaves",
                group.id, genome
            ))
            .into());
        }
        tree.nodes[idx].label = Some(genome);
    }

    if seen != expected {
        return Err(PipelineError::Consistency(format!(
            "HG_{}: tree covers {} genomes, group has {}",
            group.id,
            seen.len(),
            expected.len()
        ))
        .into());
    }

    Ok(tree)
}

// ============================================================================
// Tests
// ============================================================================
