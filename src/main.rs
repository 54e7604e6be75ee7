mod btab;
mod catalog;
mod congruence;
mod consensus;
mod error;
mod genetree;
mod groups;
mod seqio;
mod simgraph;
mod tools;
mod tree;

use anyhow::{Context, Result};
use clap::Parser;
use rustc_hash::{FxHashMap, FxHashSet};
use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use catalog::Catalog;
use congruence::CongruenceReport;
use consensus::{ConsensusBuilder, ConsensusInput, DistanceConsensus, ExternalConsensus};
use groups::{GroupSet, GroupStatus, ResolverConfig};
use simgraph::GraphThresholds;
use tools::{Diamond, FastTree, Muscle};

fn parse_fraction(s: &str) -> Result<f64, String> {
    let val: f64 = s.parse().map_err(|_| format!("Invalid number: {}", s))?;
    if !(0.0..=1.0).contains(&val) {
        Err(format!("Value must be between 0.0 and 1.0, got {}", val))
    } else {
        Ok(val)
    }
}

fn parse_evalue(s: &str) -> Result<f64, String> {
    let val: f64 = s.parse().map_err(|_| format!("Invalid number: {}", s))?;
    if val <= 0.0 {
        Err(format!("E-value ceiling must be positive, got {}", val))
    } else {
        Ok(val)
    }
}

#[derive(Parser)]
#[command(name = "locusphy")]
#[command(version)]
#[command(about = "Homolog grouping and gene-tree congruence across related genomes")]
#[command(long_about = r#"
locusphy - homologous-locus phylogenetics

Groups the genes of a locus of interest into homolog families across a
set of related genomes, builds a gene tree per family and a consensus
topology over genomes, and scores how congruent each gene tree is with
the consensus.

WORKFLOW:
  Gene catalog → DIAMOND all-vs-all → homolog groups → MUSCLE alignment
  → codon back-translation → FastTree gene trees → consensus topology
  → per-group congruence scores

OUTPUT FILES:
  groups.tsv           Homolog group membership and retention status
    Columns: Group, Genes, Genomes, Completeness, Paralog_Split,
             Status, Members

  congruence.tsv       Per-group congruence report with summary footer
    Columns: Group, Leaves, Entropy, Congruence, Status, Detail

  consensus.nwk        Consensus topology over genomes (Newick)
  aln/HG_*.faa.aln     Per-group protein alignments
  aln/HG_*.codon.aln   Per-group codon alignments
  trees/HG_*.nwk       Per-group gene trees

INPUT LAYOUT:
  The features directory holds one protein FASTA (.faa[.gz]) plus one
  CDS FASTA (.ffn[.gz]) per genome, sharing a file stem and record
  names. An optional locus annotation TSV (genome<TAB>locus_tag)
  restricts each genome to the locus of interest.

EXAMPLES:
  # Whole-proteome run over a directory of annotated genomes
  locusphy -f genomes/ -o results/

  # Restricted to an annotated locus, paralog-tolerant grouping
  locusphy -f genomes/ -l locus.tsv --paralogs -o results/
"#)]
struct Args {
    #[arg(short = 'f', long = "features-dir", value_name = "DIR", help_heading = "Input")]
    features_dir: PathBuf,

    #[arg(short = 'l', long = "locus", value_name = "FILE", help_heading = "Input")]
    locus: Option<PathBuf>,

    #[arg(short = 'i', long = "min-identity", value_name = "FRACTION",
          default_value = "0.3", value_parser = parse_fraction, help_heading = "Thresholds")]
    min_identity: f64,

    #[arg(short = 'c', long = "min-coverage", value_name = "FRACTION",
          default_value = "0.5", value_parser = parse_fraction, help_heading = "Thresholds")]
    min_coverage: f64,

    #[arg(short = 'e', long = "max-evalue", value_name = "FLOAT",
          default_value = "0.001", value_parser = parse_evalue, help_heading = "Thresholds")]
    max_evalue: f64,

    #[arg(short = 'm', long = "min-completeness", value_name = "FRACTION",
          default_value = "0.5", value_parser = parse_fraction, help_heading = "Thresholds")]
    min_completeness: f64,

    #[arg(long = "paralogs", help_heading = "Phylogeny")]
    paralogs: bool,

    #[arg(long = "min-consensus-trees", value_name = "NUM", default_value = "1",
          help_heading = "Phylogeny")]
    min_consensus_trees: usize,

    #[arg(long = "consensus-tool", value_name = "PATH", help_heading = "Phylogeny")]
    consensus_tool: Option<PathBuf>,

    #[arg(short = 'o', long, value_name = "DIR", default_value = ".", help_heading = "Output")]
    outdir: PathBuf,

    #[arg(short = 'u', long = "keep-temp", help_heading = "Output")]
    keep_temp: bool,

    #[arg(short = 'v', long, help_heading = "Output")]
    verbose: bool,

    #[arg(short = 't', long, value_name = "NUM", default_value = "0", help_heading = "Runtime")]
    threads: usize,

    #[arg(short = 'w', long, value_name = "NUM", default_value = "0", help_heading = "Runtime")]
    workers: usize,
}

fn find_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() && path.exists() {
        return Ok(path.to_path_buf());
    }

    if let Ok(paths) = env::var("PATH") {
        for dir in env::split_paths(&paths) {
            let full_path = dir.join(name);
            if full_path.exists() && full_path.is_file() {
                return Ok(full_path);
            }
        }
    }

    anyhow::bail!("{} not found in PATH. Please install it or add it to your PATH.", name)
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    let start_time = Instant::now();

    if args.threads == 0 {
        args.threads = num_cpus::get();
    }
    if args.workers == 0 {
        args.workers = args.threads.max(1);
    }

    let diamond_path = find_executable("diamond")?;
    let muscle_path = find_executable("muscle")?;
    let fasttree_path = find_executable("fasttree")?;

    if args.verbose {
        eprintln!("Found diamond: {}", diamond_path.display());
        eprintln!("Found muscle: {}", muscle_path.display());
        eprintln!("Found fasttree: {}", fasttree_path.display());
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()
        .ok();

    fs::create_dir_all(&args.outdir)
        .with_context(|| format!("Failed to create output directory {}", args.outdir.display()))?;
    let workdir = args.outdir.join("work");
    let aln_dir = args.outdir.join("aln");
    let tree_dir = args.outdir.join("trees");
    for dir in [&workdir, &aln_dir, &tree_dir] {
        fs::create_dir_all(dir)?;
    }

    // Stage 1: catalog
    eprintln!("[1/5] Loading gene catalog...");
    let catalog = catalog::load_catalog(&args.features_dir, args.locus.as_deref())?;
    eprintln!(
        "      {} genes across {} genomes",
        catalog.genes.len(),
        catalog.genome_count()
    );

    // Stage 2: similarity graph (fatal on tool failure)
    eprintln!("[2/5] Building similarity graph (diamond all-vs-all)...");
    let searcher = Diamond {
        path: diamond_path,
        max_evalue: args.max_evalue,
    };
    let thresholds = GraphThresholds {
        min_identity: args.min_identity,
        min_coverage: args.min_coverage,
        max_evalue: args.max_evalue,
    };
    let graph = simgraph::build_graph(&catalog, &searcher, &workdir, &thresholds, args.threads)?;
    eprintln!("      {} edges above thresholds", graph.edges.len());

    // Stage 3: homolog groups
    eprintln!("[3/5] Resolving homolog groups...");
    let resolver_config = ResolverConfig {
        paralog_tolerant: args.paralogs,
        min_completeness: args.min_completeness,
    };
    let group_set = groups::resolve_groups(&catalog, &graph, &resolver_config);
    drop(graph); // edges are transient; groups own everything downstream
    let retained: Vec<&groups::HomologGroup> = group_set.retained().collect();
    eprintln!(
        "      {} groups ({} retained, {} singleton, {} too small, {} incomplete)",
        group_set.groups.len(),
        retained.len(),
        group_set.count(GroupStatus::Singleton),
        group_set.count(GroupStatus::TooSmall),
        group_set.count(GroupStatus::Incomplete)
    );
    output_groups(&catalog, &group_set, &args.outdir.join("groups.tsv"))?;

    // Stage 4: per-group alignment and trees (non-fatal per group)
    eprintln!(
        "[4/5] Building gene trees for {} groups ({} workers)...",
        retained.len(),
        args.workers
    );
    let aligner = Muscle { path: muscle_path };
    let tree_builder = FastTree { path: fasttree_path };
    let outcome = genetree::build_gene_trees(
        &catalog,
        &retained,
        &aligner,
        &tree_builder,
        &aln_dir,
        &tree_dir,
        args.workers,
        args.verbose,
    );
    eprintln!(
        "      {} trees built, {} groups excluded",
        outcome.trees.len(),
        outcome.failures.len()
    );

    // Stage 5: consensus + congruence (consensus failure is fatal)
    eprintln!("[5/5] Building consensus and scoring congruence...");
    let membership = membership_profiles(&catalog, &group_set);
    let gene_trees: Vec<tree::Tree> = outcome.trees.iter().map(|t| t.tree.clone()).collect();
    let consensus_input = ConsensusInput {
        gene_trees: &gene_trees,
        membership: &membership,
    };
    let consensus = match &args.consensus_tool {
        Some(path) => ExternalConsensus {
            path: path.clone(),
            workdir: workdir.clone(),
        }
        .build(&consensus_input)?,
        None => DistanceConsensus {
            min_trees: args.min_consensus_trees,
        }
        .build(&consensus_input)?,
    };
    fs::write(args.outdir.join("consensus.nwk"), consensus.to_newick() + "\n")?;

    let report = congruence::build_report(&outcome.trees, &outcome.failures, &consensus);
    output_congruence(&report, &group_set, &args.outdir.join("congruence.tsv"))?;

    match report.aggregate {
        Some(agg) => eprintln!(
            "      aggregate congruence {:.4} over {} groups ({} excluded)",
            agg, report.scored, report.excluded
        ),
        None => eprintln!(
            "      no scorable groups ({} excluded)",
            report.excluded
        ),
    }

    if !args.keep_temp {
        let _ = fs::remove_dir_all(&workdir);
    }

    if args.verbose {
        eprintln!("Total time: {:.1}s", start_time.elapsed().as_secs_f64());
    }

    Ok(())
}

/// Genome -> homolog group ids, across all groups (including dropped
/// ones); feeds the consensus presence/absence fallback.
fn membership_profiles(
    catalog: &Catalog,
    group_set: &GroupSet,
) -> FxHashMap<String, FxHashSet<u32>> {
    let mut membership: FxHashMap<String, FxHashSet<u32>> = FxHashMap::default();
    for genome in &catalog.genomes {
        membership.entry(genome.id.clone()).or_default();
    }
    for group in &group_set.groups {
        for &member in &group.members {
            membership
                .entry(catalog.genome_of(member).to_string())
                .or_default()
                .insert(group.id);
        }
    }
    membership
}

/// Writes the homolog group membership table.
fn output_groups(catalog: &Catalog, group_set: &GroupSet, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );

    writeln!(
        out,
        "Group\tGenes\tGenomes\tCompleteness\tParalog_Split\tStatus\tMembers"
    )?;
    for group in &group_set.groups {
        let members: Vec<String> = group
            .members
            .iter()
            .map(|&m| catalog.wire_name(m))
            .collect();
        writeln!(
            out,
            "HG_{}\t{}\t{}\t{:.4}\t{}\t{}\t{}",
            group.id,
            group.members.len(),
            group.genome_count(catalog),
            group.completeness,
            if group.paralog_split { "yes" } else { "no" },
            group.status.label(),
            members.join(",")
        )?;
    }

    Ok(())
}

/// Writes the congruence report with a summary footer.
fn output_congruence(report: &CongruenceReport, group_set: &GroupSet, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );

    writeln!(out, "Group\tLeaves\tEntropy\tCongruence\tStatus\tDetail")?;
    for row in &report.rows {
        let entropy = match row.entropy {
            Some(e) => format!("{:.4}", e),
            None => "NA".to_string(),
        };
        let score = match row.score {
            Some(s) => format!("{:.4}", s),
            None => "NA".to_string(),
        };
        writeln!(
            out,
            "HG_{}\t{}\t{}\t{}\t{}\t{}",
            row.group_id, row.leaf_count, entropy, score, row.status, row.detail
        )?;
    }

    match report.aggregate {
        Some(agg) => writeln!(out, "# aggregate_congruence\t{:.4}", agg)?,
        None => writeln!(out, "# aggregate_congruence\tNA")?,
    }
    writeln!(out, "# scored_groups\t{}", report.scored)?;
    writeln!(out, "# excluded_groups\t{}", report.excluded)?;
    writeln!(
        out,
        "# dropped_before_phylogeny\t{}",
        group_set.count(GroupStatus::Singleton)
            + group_set.count(GroupStatus::TooSmall)
            + group_set.count(GroupStatus::Incomplete)
    )?;

    Ok(())
}
