//! Sequence Catalog Module
//!
//! Normalizes predicted genes across genomes into a uniform, integer-indexed
//! record set. Every downstream stage (similarity graph, homolog groups,
//! per-group trees) addresses genes by their dense catalog index.
//!
//! # Input Layout
//! A features directory containing, per genome, a protein FASTA
//! (`<genome>.faa` or `.faa.gz`) and a matching CDS nucleotide FASTA
//! (`<genome>.ffn` or `.ffn.gz`). Record names must agree between the two
//! files. Prodigal-style coordinate comments in headers
//! (`# start # end # strand # ...`) are parsed when present.
//!
//! An optional locus annotation TSV (`genome<TAB>locus_tag`) restricts the
//! catalog to the locus of interest; genomes without annotation rows
//! contribute all of their genes.

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::seqio::FastaFile;

// ============================================================================
// Data Structures
// ============================================================================

/// Genomic coordinates of a gene on its source contig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneCoords {
    /// Start position (1-based, as emitted by gene callers).
    pub start: usize,
    /// End position (inclusive).
    pub end: usize,
    /// Strand orientation ('+' or '-').
    pub strand: char,
}

/// A single predicted gene, owned by exactly one genome.
#[derive(Debug, Clone)]
pub struct Gene {
    /// Index of the owning genome in `Catalog::genomes`.
    pub genome: usize,
    /// Locus tag unique within the genome.
    pub locus_tag: String,
    /// Amino-acid sequence.
    pub protein: String,
    /// CDS nucleotide sequence.
    pub nucleotide: String,
    /// Coordinates parsed from the header, when present.
    pub coords: Option<GeneCoords>,
}

/// A genome: identifier plus the ordered genes it contributed.
#[derive(Debug, Clone)]
pub struct Genome {
    /// Sanitized genome identifier (derived from the file stem).
    pub id: String,
    /// Catalog indices of this genome's genes, in file order.
    pub genes: Vec<usize>,
}

/// Immutable catalog of all genes across all genomes.
///
/// Genes are arena-allocated and addressed by dense index; the wire name
/// `genome|locus_tag` is used wherever sequences cross a tool boundary.
#[derive(Debug, Default)]
pub struct Catalog {
    /// All genes, arena order = load order.
    pub genes: Vec<Gene>,
    /// All genomes, sorted by id.
    pub genomes: Vec<Genome>,
    name_index: FxHashMap<String, usize>,
}

impl Catalog {
    /// Number of genomes in the catalog.
    pub fn genome_count(&self) -> usize {
        self.genomes.len()
    }

    /// Wire name (`genome|locus_tag`) for a gene index.
    pub fn wire_name(&self, gene: usize) -> String {
        let g = &self.genes[gene];
        format!("{}|{}", self.genomes[g.genome].id, g.locus_tag)
    }

    /// Resolves a wire name back to a gene index.
    pub fn gene_by_wire_name(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Genome id string for a gene index.
    pub fn genome_of(&self, gene: usize) -> &str {
        &self.genomes[self.genes[gene].genome].id
    }

    /// Rebuilds the wire-name lookup; fails on duplicate gene names.
    pub(crate) fn rebuild_name_index(&mut self) -> Result<()> {
        self.name_index.clear();
        for idx in 0..self.genes.len() {
            let name = self.wire_name(idx);
            if self.name_index.insert(name.clone(), idx).is_some() {
                return Err(
                    PipelineError::InputFormat(format!("duplicate gene name: {}", name)).into(),
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sample Name Sanitization
// ============================================================================

/// Sanitizes a genome/sample name for use in wire names and file paths.
///
/// Shell-hostile punctuation and whitespace become underscores; grouping
/// characters are dropped. The '|' replacement is load-bearing: wire names
/// use '|' as the genome/locus-tag separator.
pub fn sanitize_sample_name(original: &str) -> String {
    let mut out = String::with_capacity(original.len());
    for c in original.chars() {
        match c {
            '#' | '*' | ':' | ';' | ' ' | '|' | '"' | '\'' | '=' | '-' => out.push('_'),
            '(' | ')' | '/' | '\\' | '[' | ']' | ',' => {}
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Prodigal-style Header Parsing
// ============================================================================

/// Parses coordinates from a prodigal-style header description:
/// `# 138 # 1161 # 1 # ID=1_1;...`. Returns None if the description does
/// not carry the expected comment fields.
fn parse_coords(desc: &str) -> Option<GeneCoords> {
    let fields: Vec<&str> = desc.split('#').map(|f| f.trim()).collect();
    // Leading empty field before the first '#'
    if fields.len() < 4 {
        return None;
    }
    let start: usize = fields[1].parse().ok()?;
    let end: usize = fields[2].parse().ok()?;
    let strand = match fields[3] {
        "1" | "+" => '+',
        "-1" | "-" => '-',
        _ => return None,
    };
    Some(GeneCoords { start, end, strand })
}

// ============================================================================
// Catalog Loading
// ============================================================================

/// Loads the catalog from a features directory.
///
/// # Arguments
/// * `features_dir` - directory of per-genome `.faa`/`.ffn` pairs
/// * `locus_annotation` - optional TSV restricting genes per genome
///
/// # Errors
/// `InputFormat` on an empty directory, a `.faa` without its `.ffn`
/// sibling (or vice versa), protein/nucleotide record mismatches, or an
/// unparsable annotation row. All validation happens here, before any
/// external tool is invoked.
pub fn load_catalog(features_dir: &Path, locus_annotation: Option<&Path>) -> Result<Catalog> {
    let locus_filter = match locus_annotation {
        Some(path) => Some(read_locus_annotation(path)?),
        None => None,
    };

    let mut stems = find_genome_stems(features_dir)?;
    if stems.is_empty() {
        return Err(PipelineError::InputFormat(format!(
            "no .faa/.ffn genome pairs found in {}",
            features_dir.display()
        ))
        .into());
    }
    stems.sort();

    let mut catalog = Catalog::default();

    for (stem, faa_path, ffn_path) in stems {
        let genome_id = sanitize_sample_name(&stem);
        let keep: Option<&FxHashSet<String>> =
            locus_filter.as_ref().and_then(|m| m.get(&genome_id));

        let proteins = FastaFile::open(&faa_path)
            .with_context(|| format!("Reading proteins for genome {}", genome_id))?
            .read_all()?;
        let nucleotides = FastaFile::open(&ffn_path)
            .with_context(|| format!("Reading CDS sequences for genome {}", genome_id))?
            .read_all()?;

        let mut nucl_by_name: FxHashMap<&str, &str> = FxHashMap::default();
        for rec in &nucleotides {
            nucl_by_name.insert(rec.name.as_str(), rec.seq.as_str());
        }

        let genome_idx = catalog.genomes.len();
        let mut gene_indices = Vec::new();

        for rec in &proteins {
            if let Some(filter) = keep {
                if !filter.contains(&rec.name) {
                    continue;
                }
            }
            let nucl = nucl_by_name.get(rec.name.as_str()).ok_or_else(|| {
                PipelineError::InputFormat(format!(
                    "genome {}: protein {} has no matching CDS record in {}",
                    genome_id,
                    rec.name,
                    ffn_path.display()
                ))
            })?;
            if rec.seq.is_empty() || nucl.is_empty() {
                return Err(PipelineError::InputFormat(format!(
                    "genome {}: empty sequence for {}",
                    genome_id, rec.name
                ))
                .into());
            }

            let gene_idx = catalog.genes.len();
            catalog.genes.push(Gene {
                genome: genome_idx,
                locus_tag: rec.name.clone(),
                protein: rec.seq.trim_end_matches('*').to_string(),
                nucleotide: nucl.to_string(),
                coords: rec.desc.as_deref().and_then(parse_coords),
            });
            gene_indices.push(gene_idx);
        }

        if gene_indices.is_empty() {
            // Annotated-away genomes still count toward completeness
            // denominators, so the genome record is kept.
            if keep.is_none() {
                return Err(PipelineError::InputFormat(format!(
                    "genome {}: no protein records in {}",
                    genome_id,
                    faa_path.display()
                ))
                .into());
            }
        }

        // Genomes keep their genes in locus order when coordinates are
        // available, file order otherwise.
        gene_indices.sort_by_key(|&idx| {
            catalog.genes[idx].coords.map(|c| c.start).unwrap_or(usize::MAX)
        });

        catalog.genomes.push(Genome {
            id: genome_id,
            genes: gene_indices,
        });
    }

    catalog.rebuild_name_index()?;

    Ok(catalog)
}

/// Finds `<stem>.faa[.gz]` files and pairs each with its `<stem>.ffn[.gz]`
/// sibling. A protein file without a CDS sibling is an input error.
fn find_genome_stems(dir: &Path) -> Result<Vec<(String, PathBuf, PathBuf)>> {
    let faa_suffixes = [".faa.gz", ".faa"];
    let ffn_suffixes = [".ffn.gz", ".ffn"];

    let mut pairs = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read features directory {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };

        for suffix in &faa_suffixes {
            if let Some(stem) = filename.strip_suffix(suffix) {
                let sibling = ffn_suffixes
                    .iter()
                    .map(|s| dir.join(format!("{}{}", stem, s)))
                    .find(|p| p.exists());
                match sibling {
                    Some(ffn) => pairs.push((stem.to_string(), path.clone(), ffn)),
                    None => {
                        return Err(PipelineError::InputFormat(format!(
                            "genome {}: found {} but no matching .ffn CDS file",
                            stem, filename
                        ))
                        .into())
                    }
                }
                break;
            }
        }
    }

    Ok(pairs)
}

/// Reads the two-column locus annotation TSV into genome -> locus tags.
fn read_locus_annotation(path: &Path) -> Result<FxHashMap<String, FxHashSet<String>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open locus annotation: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut map: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split('\t');
        let (genome, tag) = match (parts.next(), parts.next()) {
            (Some(g), Some(t)) if !g.is_empty() && !t.is_empty() => (g, t),
            _ => {
                return Err(PipelineError::InputFormat(format!(
                    "locus annotation line {}: expected genome<TAB>locus_tag",
                    lineno + 1
                ))
                .into())
            }
        };
        map.entry(sanitize_sample_name(genome))
            .or_default()
            .insert(tag.to_string());
    }

    Ok(map)
}

// ============================================================================
// Tests
// ============================================================================
