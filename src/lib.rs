//! locusphy - Homologous-Locus Phylogenetic Congruence
//!
//! Locates a reference locus across related genomes, groups its genes
//! into homolog families, builds per-family and locus-level phylogenies,
//! and scores how congruent each gene tree is with the consensus.
//!
//! # Modules
//! - `seqio`: FASTA I/O with gzip support
//! - `catalog`: per-genome gene/protein catalog loading
//! - `btab`: BLAST/DIAMOND tabular hit parsing
//! - `simgraph`: similarity graph construction over all genes
//! - `groups`: homolog group resolution (union-find + RBH splitting)
//! - `tree`: arena-based phylogenetic trees (Newick, restriction, splits)
//! - `tools`: external tool capability traits and implementations
//! - `genetree`: per-group alignment/tree orchestration
//! - `consensus`: consensus topology over genomes
//! - `congruence`: gene-tree vs consensus congruence statistic
//! - `error`: pipeline error taxonomy

pub mod btab;
pub mod catalog;
pub mod congruence;
pub mod consensus;
pub mod error;
pub mod genetree;
pub mod groups;
pub mod seqio;
pub mod simgraph;
pub mod tools;
pub mod tree;
